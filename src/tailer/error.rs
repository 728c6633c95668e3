// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Field error: {0}")]
    Field(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Processor error: {0}")]
    Processor(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Regex error: {0}")]
    Regex(String),

    #[error("Watcher error: {0}")]
    Watcher(#[from] crate::tailer::watcher::WatcherError),
}

pub type Result<T> = std::result::Result<T, Error>;
