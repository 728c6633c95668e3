// SPDX-License-Identifier: Apache-2.0

//! File system watchers that report when a tailed path is renamed or removed.
//!
//! Two strategies are available:
//! - **Native**: OS notifications (inotify, FSEvents, ReadDirectoryChangesW).
//! - **Poll**: periodic `stat` of every watched file, for network file systems
//!   where native events are missing or unreliable.
//!
//! `auto` tries native first and falls back to polling.

mod native;
mod poll;
mod traits;

pub use native::NativeWatcher;
pub use poll::PollWatcher;
pub use traits::{FileEvent, FileEventKind, FileWatcher, WatcherError};

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::bounded_channel::BoundedSender;
use crate::tailer::file_id::FileIdentity;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    #[default]
    Auto,
    Native,
    Poll,
}

impl std::str::FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(WatchMode::Auto),
            "native" => Ok(WatchMode::Native),
            "poll" | "polling" => Ok(WatchMode::Poll),
            _ => Err(format!(
                "Invalid watch mode '{}'. Valid options: auto, native, poll",
                s
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub mode: WatchMode,
    /// How often the poll backend stats watched files.
    pub poll_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Auto,
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub fn create_watcher(
    config: &WatcherConfig,
    identity: Arc<dyn FileIdentity>,
    events: BoundedSender<FileEvent>,
) -> Result<Box<dyn FileWatcher>, WatcherError> {
    match config.mode {
        WatchMode::Native => Ok(Box::new(NativeWatcher::new(events)?)),
        WatchMode::Poll => Ok(Box::new(PollWatcher::new(
            events,
            identity,
            config.poll_interval,
        )?)),
        WatchMode::Auto => match NativeWatcher::new(events.clone()) {
            Ok(watcher) => {
                info!(
                    backend = watcher.backend_name(),
                    "Using native file system watcher"
                );
                Ok(Box::new(watcher))
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Native file watching unavailable, falling back to polling"
                );
                Ok(Box::new(PollWatcher::new(
                    events,
                    identity,
                    config.poll_interval,
                )?))
            }
        },
    }
}
