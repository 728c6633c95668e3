// SPDX-License-Identifier: Apache-2.0

//! Native file system watcher using the `notify` crate.
//!
//! Uses OS-level file system notifications:
//! - Linux: inotify
//! - macOS: FSEvents
//! - Windows: ReadDirectoryChangesW

use std::path::Path;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use super::traits::{FileEvent, FileEventKind, FileWatcher, WatcherError};
use crate::bounded_channel::{BoundedSender, TrySendError};

pub struct NativeWatcher {
    watcher: RecommendedWatcher,
}

impl NativeWatcher {
    pub fn new(events: BoundedSender<FileEvent>) -> Result<Self, WatcherError> {
        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(file_event) = convert_event(event) {
                        forward(&events, file_event);
                    }
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            },
            Config::default(),
        )
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok(Self { watcher })
    }
}

// The notify callback thread must not block: the consumer of the event
// channel is the same task that calls watch/unwatch.
fn forward(events: &BoundedSender<FileEvent>, event: FileEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            debug!(?event, "Event channel full, dropping file event");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

fn convert_event(event: Event) -> Option<FileEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => FileEventKind::Create,
        EventKind::Modify(ModifyKind::Name(_)) => FileEventKind::Rename,
        EventKind::Modify(_) => FileEventKind::Modify,
        EventKind::Remove(_) => FileEventKind::Remove,
        EventKind::Access(_) => return None,
        EventKind::Other | EventKind::Any => FileEventKind::Other,
    };

    if event.paths.is_empty() {
        return None;
    }

    Some(FileEvent::new(kind, event.paths))
}

impl FileWatcher for NativeWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watcher
            .unwatch(path)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    fn is_native(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "inotify"
        }
        #[cfg(target_os = "macos")]
        {
            "FSEvents"
        }
        #[cfg(target_os = "windows")]
        {
            "ReadDirectoryChangesW"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            "native"
        }
    }
}
