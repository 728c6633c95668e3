// SPDX-License-Identifier: Apache-2.0

//! Traits and types for file system watchers.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("watcher initialization failed: {0}")]
    Init(String),

    #[error("watch failed: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Create,
    Modify,
    Remove,
    /// The path was moved away or now refers to a different file.
    Rename,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub paths: Vec<PathBuf>,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, paths: Vec<PathBuf>) -> Self {
        Self { kind, paths }
    }

    pub fn remove(path: PathBuf) -> Self {
        Self::new(FileEventKind::Remove, vec![path])
    }

    pub fn rename(path: PathBuf) -> Self {
        Self::new(FileEventKind::Rename, vec![path])
    }

    /// True for events that mean a tailed path no longer leads to the file
    /// being read.
    pub fn ends_tailing(&self) -> bool {
        matches!(self.kind, FileEventKind::Remove | FileEventKind::Rename)
    }
}

/// A source of rename/remove notifications for individually watched files.
///
/// Events are pushed into the channel the watcher was created with;
/// implementations never block the caller of `watch`/`unwatch` on a full
/// event channel.
pub trait FileWatcher: Send {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError>;

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError>;

    /// True for inotify/FSEvents/ReadDirectoryChangesW, false for polling.
    fn is_native(&self) -> bool;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}
