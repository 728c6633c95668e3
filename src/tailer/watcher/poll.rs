// SPDX-License-Identifier: Apache-2.0

//! Polling watcher for file systems without reliable native notifications
//! (NFS, network shares, some container overlays).
//!
//! A background thread stats every watched file once per interval and
//! reports a remove when the path is gone, or a rename when the path now
//! refers to a different file.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::RecvTimeoutError;
use tracing::debug;

use super::traits::{FileEvent, FileWatcher, WatcherError};
use crate::bounded_channel::{BoundedSender, TrySendError};
use crate::tailer::file_id::FileIdentity;

type WatchedFiles = Arc<Mutex<HashMap<PathBuf, String>>>;

pub struct PollWatcher {
    watched: WatchedFiles,
    identity: Arc<dyn FileIdentity>,
    stop_tx: Option<flume::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PollWatcher {
    pub fn new(
        events: BoundedSender<FileEvent>,
        identity: Arc<dyn FileIdentity>,
        poll_interval: Duration,
    ) -> Result<Self, WatcherError> {
        let watched: WatchedFiles = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);

        let handle = {
            let watched = watched.clone();
            let identity = identity.clone();
            thread::Builder::new()
                .name("logtail-poll-watcher".into())
                .spawn(move || {
                    loop {
                        match stop_rx.recv_timeout(poll_interval) {
                            Err(RecvTimeoutError::Timeout) => {}
                            _ => break,
                        }
                        for event in scan(&watched, identity.as_ref()) {
                            match events.try_send(event) {
                                Ok(()) => {}
                                Err(TrySendError::Full(event)) => {
                                    debug!(?event, "Event channel full, dropping file event")
                                }
                                Err(TrySendError::Disconnected(_)) => return,
                            }
                        }
                    }
                })
                .map_err(|e| WatcherError::Init(e.to_string()))?
        };

        Ok(Self {
            watched,
            identity,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

/// Check every watched file once, forgetting those that ended.
fn scan(watched: &WatchedFiles, identity: &dyn FileIdentity) -> Vec<FileEvent> {
    let Ok(mut watched) = watched.lock() else {
        return Vec::new();
    };

    let mut events = Vec::new();
    watched.retain(|path, key| match std::fs::metadata(path) {
        Ok(metadata) => {
            if identity.key_for(path, &metadata) == *key {
                true
            } else {
                events.push(FileEvent::rename(path.clone()));
                false
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            events.push(FileEvent::remove(path.clone()));
            false
        }
        Err(e) => {
            debug!(path = ?path, error = %e, "Unable to stat watched file");
            true
        }
    });
    events
}

impl FileWatcher for PollWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        let key = self.identity.identity(path)?;
        let mut watched = self
            .watched
            .lock()
            .map_err(|e| WatcherError::Watch(format!("mutex poisoned: {}", e)))?;
        watched.insert(path.to_path_buf(), key);
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        let mut watched = self
            .watched
            .lock()
            .map_err(|e| WatcherError::Watch(format!("mutex poisoned: {}", e)))?;
        watched.remove(path);
        Ok(())
    }

    fn is_native(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "poll"
    }
}

impl Drop for PollWatcher {
    fn drop(&mut self) {
        // Disconnecting the stop channel wakes the thread immediately.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
