// SPDX-License-Identifier: Apache-2.0

//! Durable per-file read offsets.
//!
//! Offsets live in memory and are written to a single JSON database file by
//! a periodic flusher and on shutdown. The file keeps one object per bucket;
//! tailer offsets go in the `tailer` bucket and any other buckets found on
//! disk are preserved as they are:
//!
//! ```json
//! {"buckets": {"tailer": {"/var/log/app.log::1234": {"offset": 4096}}}}
//! ```
//!
//! Writes are atomic: the state is written to a temporary file which is then
//! renamed over the database.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::tailer::error::{Error, Result};

pub const BUCKET: &str = "tailer";

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Value stored per file key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub offset: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatabaseState {
    #[serde(default)]
    buckets: HashMap<String, HashMap<String, serde_json::Value>>,
}

fn read_state(path: &Path) -> Result<std::result::Result<DatabaseState, serde_json::Error>> {
    let file = File::open(path)
        .map_err(|e| Error::Persistence(format!("failed to open database: {}", e)))?;
    Ok(serde_json::from_reader(BufReader::new(file)))
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

/// Shared checkpoint store. Create one at startup and hand out `Arc`s.
#[derive(Debug)]
pub struct CheckpointStore {
    path: Option<PathBuf>,
    offsets: RwLock<HashMap<String, u64>>,
    foreign_buckets: HashMap<String, HashMap<String, serde_json::Value>>,
    dirty: AtomicBool,
    // serializes writers of the database file
    write_lock: std::sync::Mutex<()>,
}

impl CheckpointStore {
    /// Open or create a database at `path`. A database that cannot be
    /// parsed is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), false)
    }

    /// Like [`CheckpointStore::open`], but a database that cannot be parsed
    /// is moved to `<path>.corrupt` and tailing starts without checkpoints.
    pub fn open_or_recover(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), true)
    }

    fn open_with(path: &Path, recover: bool) -> Result<Self> {
        let path = path.to_path_buf();

        let mut state = if path.exists() {
            match read_state(&path)? {
                Ok(state) => state,
                Err(e) if recover => {
                    let aside = corrupt_path(&path);
                    error!(
                        path = ?path,
                        moved_to = ?aside,
                        error = %e,
                        "Checkpoint database is corrupt, starting without checkpoints"
                    );
                    if let Err(e) = fs::rename(&path, &aside) {
                        warn!(path = ?path, error = %e, "Failed to move corrupt checkpoint database aside");
                    }
                    DatabaseState::default()
                }
                Err(e) => {
                    return Err(Error::Persistence(format!(
                        "failed to parse database: {}",
                        e
                    )));
                }
            }
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent).map_err(|e| {
                        Error::Persistence(format!("failed to create database directory: {}", e))
                    })?;
                }
            }
            DatabaseState::default()
        };

        let mut offsets = HashMap::new();
        if let Some(bucket) = state.buckets.remove(BUCKET) {
            for (key, value) in bucket {
                match serde_json::from_value::<CheckpointRecord>(value) {
                    Ok(record) => {
                        offsets.insert(key, record.offset);
                    }
                    Err(e) => warn!(key = %key, error = %e, "Ignoring malformed checkpoint"),
                }
            }
        }

        debug!(path = ?path, checkpoints = offsets.len(), "Opened checkpoint store");

        Ok(Self {
            path: Some(path),
            offsets: RwLock::new(offsets),
            foreign_buckets: state.buckets,
            dirty: AtomicBool::new(false),
            write_lock: std::sync::Mutex::new(()),
        })
    }

    /// A store that never touches disk.
    pub fn open_memory() -> Self {
        Self {
            path: None,
            offsets: RwLock::new(HashMap::new()),
            foreign_buckets: HashMap::new(),
            dirty: AtomicBool::new(false),
            write_lock: std::sync::Mutex::new(()),
        }
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.offsets.read().ok()?.get(key).copied()
    }

    /// Record progress for `key`. Offsets only move forward; use
    /// [`CheckpointStore::reset`] after a truncation.
    pub fn put(&self, key: &str, offset: u64) {
        let Ok(mut offsets) = self.offsets.write() else {
            error!(key = %key, "Checkpoint state lock poisoned, dropping update");
            return;
        };
        let current = offsets.entry(key.to_string()).or_insert(0);
        if offset > *current {
            *current = offset;
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Rewind `key` to the start of the file.
    pub fn reset(&self, key: &str) {
        let Ok(mut offsets) = self.offsets.write() else {
            error!(key = %key, "Checkpoint state lock poisoned, dropping reset");
            return;
        };
        offsets.insert(key.to_string(), 0);
        self.dirty.store(true, Ordering::Release);
    }

    /// Forget `key`. Used once the file it identified is gone for good.
    pub fn remove(&self, key: &str) {
        let Ok(mut offsets) = self.offsets.write() else {
            error!(key = %key, "Checkpoint state lock poisoned, dropping removal");
            return;
        };
        if offsets.remove(key).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the current offsets to disk.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            self.dirty.store(false, Ordering::Release);
            return Ok(());
        };

        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;

        // Clear before snapshotting so a concurrent put marks the store dirty again.
        self.dirty.store(false, Ordering::Release);
        let bucket: HashMap<String, serde_json::Value> = {
            let offsets = self
                .offsets
                .read()
                .map_err(|e| Error::Persistence(e.to_string()))?;
            offsets
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::json!({ "offset": *v })))
                .collect()
        };

        let mut buckets = self.foreign_buckets.clone();
        buckets.insert(BUCKET.to_string(), bucket);

        if let Err(e) = atomic_write(path, &DatabaseState { buckets }) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Periodically flush dirty state until `cancel` fires.
    pub fn spawn_flusher(
        store: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !store.is_dirty() {
                            continue;
                        }
                        let store = store.clone();
                        match tokio::task::spawn_blocking(move || store.flush()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(error = %e, "Failed to persist checkpoints"),
                            Err(e) => error!(error = %e, "Checkpoint flush task failed"),
                        }
                    }
                }
            }
        })
    }

    /// Final flush, bounded by `grace`. Updates racing with close may be lost.
    pub async fn close(store: Arc<Self>, grace: Duration) -> Result<()> {
        let flush = tokio::task::spawn_blocking(move || store.flush());
        match tokio::time::timeout(grace, flush).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => Err(Error::Persistence(format!("flush task failed: {}", e))),
            Err(_) => Err(Error::Persistence(
                "timed out flushing checkpoints on close".to_string(),
            )),
        }
    }
}

fn atomic_write(path: &Path, state: &DatabaseState) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, state)
        .map_err(|e| Error::Persistence(format!("failed to write database: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush database: {}", e)))?;
    drop(writer);

    fs::rename(&temp_path, path)
        .map_err(|e| Error::Persistence(format!("failed to rename database file: {}", e)))
}
