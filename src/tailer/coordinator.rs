// SPDX-License-Identifier: Apache-2.0

//! The tailer: discovers files, runs one pipeline per file and retires
//! pipelines whose files go away.
//!
//! A single coordinator task owns discovery, watcher events and the
//! existence sweep. Per-file tasks report back over a channel when they end,
//! and only then is their entry removed from the tracked set.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use portable_atomic::{AtomicBool, Ordering};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::tailer::checkpoint::CheckpointStore;
use crate::tailer::config::TailerConfig;
use crate::tailer::dispatcher::DispatchSettings;
use crate::tailer::error::Result;
use crate::tailer::file_id::{FileIdentity, inode, platform_identity};
use crate::tailer::finder::FileMatcher;
use crate::tailer::pipeline::{PipelineContext, tail_file};
use crate::tailer::processor::Processor;
use crate::tailer::reader::{ExitReason, TailTarget, start_position};
use crate::tailer::sink::Sink;
use crate::tailer::watcher::{FileEvent, FileWatcher, WatcherConfig, create_watcher};

const EVENT_CHANNEL_SIZE: usize = 1024;
const FINISHED_CHANNEL_SIZE: usize = 256;

// Discovery ticks a vanished path keeps its read-from-start mark.
const RESTART_RETENTION_TICKS: u32 = 3;

struct TrackedFile {
    id: u64,
    file_key: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    /// Cancelled, waiting for the pipeline to report back.
    stopping: bool,
}

/// Sent by a per-file task when its pipeline has ended.
#[derive(Debug)]
struct Finished {
    path: PathBuf,
    id: u64,
    reason: Option<ExitReason>,
}

/// Tails every file matched by the configured globs.
pub struct Tailer {
    config: TailerConfig,
    matcher: FileMatcher,
    store: Arc<CheckpointStore>,
    sink: Arc<dyn Sink>,
    processor: Option<Arc<dyn Processor>>,
    identity: Arc<dyn FileIdentity>,
    paused: Arc<AtomicBool>,
    tracked: Mutex<HashMap<PathBuf, TrackedFile>>,
    /// Paths whose next file must be read from the start, with the time
    /// they were marked.
    restart: Mutex<HashMap<PathBuf, Instant>>,
    next_id: portable_atomic::AtomicU64,
}

impl Tailer {
    /// Validate `config` and build a tailer. Nothing runs until [`Tailer::run`].
    pub fn new(config: TailerConfig, store: Arc<CheckpointStore>, sink: Arc<dyn Sink>) -> Result<Self> {
        config.validate()?;
        let processor = config.build_processor()?;
        let matcher = FileMatcher::new(config.include.clone(), &config.ignore);

        Ok(Self {
            config,
            matcher,
            store,
            sink,
            processor,
            identity: platform_identity(),
            paused: Arc::new(AtomicBool::new(false)),
            tracked: Mutex::new(HashMap::new()),
            restart: Mutex::new(HashMap::new()),
            next_id: portable_atomic::AtomicU64::new(0),
        })
    }

    /// Replace the configured processor.
    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Flag that, while set, makes the tailer read and checkpoint without
    /// forwarding records.
    pub fn pause_handle(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Paths with a live pipeline.
    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        self.tracked
            .lock()
            .map(|t| {
                t.iter()
                    .filter(|(_, f)| !f.stopping)
                    .map(|(p, _)| p.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run until `cancel` fires, then stop every pipeline within the
    /// shutdown grace period.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let dispatch = DispatchSettings::from_config(
            &self.config,
            self.processor.clone(),
            self.sink.clone(),
            self.paused.clone(),
        );
        let ctx = Arc::new(PipelineContext {
            config: self.config.clone(),
            dispatch: Arc::new(dispatch),
            store: self.store.clone(),
            identity: self.identity.clone(),
        });

        let (events_tx, mut events_rx) = bounded::<FileEvent>(EVENT_CHANNEL_SIZE);
        let watcher_config = WatcherConfig {
            mode: self.config.watch_mode,
            poll_interval: self.config.poll_interval,
        };
        let mut watcher = create_watcher(&watcher_config, self.identity.clone(), events_tx)?;
        info!(
            backend = watcher.backend_name(),
            native = watcher.is_native(),
            include = ?self.config.include,
            "Tailer started"
        );

        let (finished_tx, mut finished_rx) = bounded::<Finished>(FINISHED_CHANNEL_SIZE);

        let mut discovery = tokio::time::interval(self.config.discovery_interval);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval_at(
            Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(finished) = finished_rx.next() => {
                    self.handle_finished(finished, watcher.as_mut());
                }

                Some(event) = events_rx.next() => {
                    self.handle_event(event);
                }

                _ = discovery.tick() => {
                    self.discover(&ctx, watcher.as_mut(), &finished_tx, &cancel).await;
                }

                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }

        self.close(watcher, &mut finished_rx).await;
        Ok(())
    }

    async fn discover(
        &self,
        ctx: &Arc<PipelineContext>,
        watcher: &mut dyn FileWatcher,
        finished_tx: &BoundedSender<Finished>,
        cancel: &CancellationToken,
    ) {
        let matcher = self.matcher.clone();
        let paths = match tokio::task::spawn_blocking(move || matcher.resolve()).await {
            Ok(paths) => paths,
            Err(e) => {
                error!(error = %e, "File discovery task failed");
                return;
            }
        };

        let limit = self.config.max_open_files();
        for path in paths {
            if self.is_tracked(&path) {
                continue;
            }
            if let Some(limit) = limit {
                if self.tracked_count() >= limit {
                    debug!(limit, "Open file limit reached, deferring remaining files");
                    break;
                }
            }

            let target = match self.build_target(&path).await {
                Ok(Some(target)) => target,
                Ok(None) => continue,
                Err(e) => {
                    debug!(path = ?path, error = %e, "Unable to inspect discovered file");
                    continue;
                }
            };

            self.spawn(target, ctx, finished_tx, cancel);
            if let Err(e) = watcher.watch(&path) {
                warn!(path = ?path, error = %e, "Failed to watch file, relying on sweep");
            }
        }
    }

    /// Target for a newly discovered path, or `None` when it should not be
    /// tailed right now.
    async fn build_target(&self, path: &Path) -> io::Result<Option<TailTarget>> {
        let metadata = tokio::fs::metadata(path).await?;

        if let Some(dead_after) = self.config.ignore_dead_log {
            let idle = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if idle > dead_after {
                debug!(path = ?path, idle = ?idle, "Skipping inactive file");
                return Ok(None);
            }
        }

        let file_key = self.identity.key_for(path, &metadata);
        if self.is_key_tracked(&file_key) {
            debug!(path = ?path, file_key = %file_key, "File already tailed under another path");
            return Ok(None);
        }

        let restart = self
            .restart
            .lock()
            .map(|mut r| r.remove(path).is_some())
            .unwrap_or(false);
        let from_beginning = self.config.from_beginning || restart;
        let checkpoint = if restart {
            // a recycled inode can carry the previous file's offset
            if self.store.get(&file_key).is_some() {
                self.store.reset(&file_key);
            }
            None
        } else {
            self.store.get(&file_key)
        };
        let offset = start_position(
            checkpoint,
            metadata.len(),
            from_beginning,
            self.config.file_size_threshold,
        );

        Ok(Some(TailTarget {
            path: path.to_path_buf(),
            file_key,
            offset,
            from_beginning,
            inode: inode(&metadata),
        }))
    }

    fn spawn(
        &self,
        target: TailTarget,
        ctx: &Arc<PipelineContext>,
        finished_tx: &BoundedSender<Finished>,
        cancel: &CancellationToken,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = target.path.clone();
        let file_key = target.file_key.clone();
        let file_cancel = cancel.child_token();

        info!(path = ?path, offset = target.offset, "Tailing file");

        let handle = {
            let ctx = ctx.clone();
            let finished_tx = finished_tx.clone();
            let file_cancel = file_cancel.clone();
            let shutdown = cancel.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let reason = match tail_file(target, ctx, file_cancel).await {
                    Ok(reason) => Some(reason),
                    Err(e) => {
                        error!(path = ?path, error = %e, "Failed to start file pipeline");
                        None
                    }
                };

                let finished = Finished { path, id, reason };
                tokio::select! {
                    biased;
                    _ = finished_tx.send(finished) => {}
                    _ = shutdown.cancelled() => {}
                }
            })
        };

        if let Ok(mut tracked) = self.tracked.lock() {
            tracked.insert(
                path,
                TrackedFile {
                    id,
                    file_key,
                    cancel: file_cancel,
                    handle,
                    stopping: false,
                },
            );
        }
    }

    fn handle_finished(&self, finished: Finished, watcher: &mut dyn FileWatcher) {
        let removed = match self.tracked.lock() {
            Ok(mut tracked) => {
                let current = tracked
                    .get(&finished.path)
                    .is_some_and(|entry| entry.id == finished.id);
                current && tracked.remove(&finished.path).is_some()
            }
            Err(_) => false,
        };
        if !removed {
            return;
        }

        if let Err(e) = watcher.unwatch(&finished.path) {
            debug!(path = ?finished.path, error = %e, "Failed to unwatch file");
        }
        if finished.reason.is_some_and(ExitReason::restart_from_beginning) {
            self.mark_restart(&finished.path);
        }
        info!(path = ?finished.path, reason = ?finished.reason, "Stopped tailing file");
    }

    fn handle_event(&self, event: FileEvent) {
        if !event.ends_tailing() {
            return;
        }
        for path in &event.paths {
            if self.stop(path) {
                debug!(path = ?path, kind = ?event.kind, "Tailed file moved or removed");
                self.mark_restart(path);
            }
        }
    }

    /// Stop every tracked path that no longer exists. An open descriptor on a
    /// deleted file never produces a delete notification. Restart marks of
    /// paths that stayed gone are dropped.
    async fn sweep(&self) {
        self.prune_restart().await;

        for path in self.tracked_paths() {
            match tokio::fs::symlink_metadata(&path).await {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if self.stop(&path) {
                        debug!(path = ?path, "Tailed file no longer exists");
                        self.mark_restart(&path);
                    }
                }
                _ => {}
            }
        }
    }

    /// Ask the pipeline for `path` to stop. Its entry stays until it reports
    /// back, so no second reader starts on the same file meanwhile.
    fn stop(&self, path: &Path) -> bool {
        let Ok(mut tracked) = self.tracked.lock() else {
            return false;
        };
        match tracked.get_mut(path) {
            Some(entry) if !entry.stopping => {
                entry.stopping = true;
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn mark_restart(&self, path: &Path) {
        if let Ok(mut restart) = self.restart.lock() {
            restart.insert(path.to_path_buf(), Instant::now());
        }
    }

    async fn prune_restart(&self) {
        let retention = self.config.discovery_interval * RESTART_RETENTION_TICKS;
        let expired: Vec<PathBuf> = match self.restart.lock() {
            Ok(restart) => restart
                .iter()
                .filter(|(_, marked)| marked.elapsed() >= retention)
                .map(|(path, _)| path.clone())
                .collect(),
            Err(_) => return,
        };

        for path in expired {
            if tokio::fs::symlink_metadata(&path).await.is_ok() {
                continue;
            }
            if let Ok(mut restart) = self.restart.lock() {
                restart.remove(&path);
            }
        }
    }

    fn is_tracked(&self, path: &Path) -> bool {
        self.tracked
            .lock()
            .map(|t| t.contains_key(path))
            .unwrap_or(true)
    }

    fn is_key_tracked(&self, file_key: &str) -> bool {
        self.tracked
            .lock()
            .map(|t| t.values().any(|f| f.file_key == file_key))
            .unwrap_or(true)
    }

    fn tracked_count(&self) -> usize {
        self.tracked.lock().map(|t| t.len()).unwrap_or(0)
    }

    async fn close(&self, watcher: Box<dyn FileWatcher>, finished_rx: &mut BoundedReceiver<Finished>) {
        let entries: Vec<TrackedFile> = match self.tracked.lock() {
            Ok(mut tracked) => tracked.drain().map(|(_, f)| f).collect(),
            Err(_) => Vec::new(),
        };
        info!(files = entries.len(), "Stopping tailer");

        let mut aborts: Vec<AbortHandle> = Vec::with_capacity(entries.len());
        let mut pending: FuturesUnordered<JoinHandle<()>> = FuturesUnordered::new();
        for entry in entries {
            entry.cancel.cancel();
            aborts.push(entry.handle.abort_handle());
            pending.push(entry.handle);
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            tokio::select! {
                // keep reports flowing so no task waits on a full channel
                Some(_) = finished_rx.next() => {}
                res = timeout_at(deadline, pending.next()) => match res {
                    Ok(Some(Ok(()))) => {}
                    Ok(Some(Err(e))) => error!(error = %e, "File task failed during shutdown"),
                    Ok(None) => break,
                    Err(_) => {
                        warn!(
                            remaining = pending.len(),
                            grace = ?self.config.shutdown_grace,
                            "Timed out stopping file tasks, aborting"
                        );
                        for abort in &aborts {
                            abort.abort();
                        }
                        break;
                    }
                }
            }
        }

        drop(watcher);
        info!("Tailer stopped");
    }
}

impl std::fmt::Debug for Tailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tailer")
            .field("include", &self.config.include)
            .field("tracked", &self.tracked_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailer::sink::test_support::MockSink;
    use crate::tailer::watcher::WatchMode;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn fast_config(dir: &Path) -> TailerConfig {
        TailerConfig {
            include: vec![format!("{}/*.log", dir.display())],
            from_beginning: true,
            watch_mode: WatchMode::Poll,
            poll_interval: Duration::from_millis(50),
            discovery_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(100),
            wait_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn start(tailer: Arc<Tailer>) -> (CancellationToken, JoinHandle<Result<()>>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        (cancel, tokio::spawn(async move { tailer.run(token).await }))
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(CheckpointStore::open_memory());
        assert!(Tailer::new(TailerConfig::default(), store, sink).is_err());
    }

    #[tokio::test]
    async fn test_discovers_and_forwards() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.log"), "alpha\n").unwrap();
        fs::write(dir.path().join("skip.txt"), "ignored\n").unwrap();

        let sink = Arc::new(MockSink::default());
        let store = Arc::new(CheckpointStore::open_memory());
        let tailer = Arc::new(Tailer::new(fast_config(dir.path()), store, sink.clone()).unwrap());
        let (cancel, handle) = start(tailer.clone());

        wait_until(|| sink.messages() == vec!["alpha"]).await;

        // files created later are picked up on the next discovery tick
        fs::write(dir.path().join("b.log"), "beta\n").unwrap();
        wait_until(|| sink.messages().len() == 2).await;
        assert_eq!(tailer.tracked_paths().len(), 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(tailer.tracked_paths().is_empty());

        let record = &sink.records()[1];
        assert_eq!(record.tags["filename"], "b.log");
    }

    #[tokio::test]
    async fn test_respects_max_open_files() {
        let dir = TempDir::new().unwrap();
        for name in ["a.log", "b.log", "c.log"] {
            fs::write(dir.path().join(name), "x\n").unwrap();
        }

        let mut config = fast_config(dir.path());
        config.max_open_files = 2;
        let sink = Arc::new(MockSink::default());
        let tailer = Arc::new(
            Tailer::new(config, Arc::new(CheckpointStore::open_memory()), sink.clone()).unwrap(),
        );
        let (cancel, handle) = start(tailer.clone());

        wait_until(|| sink.messages().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(tailer.tracked_paths().len(), 2);
        assert_eq!(sink.messages().len(), 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_removed_file_is_released() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "").unwrap();

        let mut config = fast_config(dir.path());
        config.from_beginning = false;
        config.file_size_threshold = 0;
        let sink = Arc::new(MockSink::default());
        let tailer = Arc::new(
            Tailer::new(config, Arc::new(CheckpointStore::open_memory()), sink.clone()).unwrap(),
        );
        let (cancel, handle) = start(tailer.clone());

        wait_until(|| tailer.tracked_paths().len() == 1).await;
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"one\n").unwrap();
        wait_until(|| sink.messages() == vec!["one"]).await;

        fs::remove_file(&path).unwrap();
        wait_until(|| tailer.tracked_paths().is_empty()).await;

        // recreated file is new data and is read from its start
        let mut file = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        file.write_all(b"two\n").unwrap();
        wait_until(|| sink.messages() == vec!["one", "two"]).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_paused_tailer_still_checkpoints() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "one\n").unwrap();

        let sink = Arc::new(MockSink::default());
        let store = Arc::new(CheckpointStore::open_memory());
        let tailer = Arc::new(Tailer::new(fast_config(dir.path()), store.clone(), sink.clone()).unwrap());
        tailer.set_paused(true);
        assert!(tailer.pause_handle().load(Ordering::Acquire));

        let (cancel, handle) = start(tailer.clone());
        let key = platform_identity().identity(&path).unwrap();
        wait_until(|| store.get(&key) == Some(4)).await;
        assert!(sink.records().is_empty());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unlimited_open_files_with_zero() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.log"), "alpha\n").unwrap();

        let mut config = fast_config(dir.path());
        config.max_open_files = 0;
        let sink = Arc::new(MockSink::default());
        let tailer = Arc::new(
            Tailer::new(config, Arc::new(CheckpointStore::open_memory()), sink.clone()).unwrap(),
        );
        let (cancel, handle) = start(tailer.clone());

        wait_until(|| sink.messages() == vec!["alpha"]).await;
        assert_eq!(tailer.tracked_paths().len(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restart_marks_of_vanished_paths_expire() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("2024-01-01.log");
        fs::write(&path, "old\n").unwrap();

        let sink = Arc::new(MockSink::default());
        let tailer = Arc::new(
            Tailer::new(fast_config(dir.path()), Arc::new(CheckpointStore::open_memory()), sink.clone())
                .unwrap(),
        );
        let (cancel, handle) = start(tailer.clone());
        wait_until(|| sink.messages() == vec!["old"]).await;

        fs::remove_file(&path).unwrap();
        wait_until(|| tailer.restart.lock().unwrap().contains_key(&path)).await;
        wait_until(|| tailer.restart.lock().unwrap().is_empty()).await;
        assert!(tailer.tracked_paths().is_empty());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_fails_before_running() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config(dir.path());
        config.discovery_interval = Duration::ZERO;
        let res = Tailer::new(
            config,
            Arc::new(CheckpointStore::open_memory()),
            Arc::new(MockSink::default()),
        );
        assert!(matches!(res, Err(crate::tailer::error::Error::Config(_))));
    }
}
