// SPDX-License-Identifier: Apache-2.0

//! Destination for finished records.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use crate::bounded_channel::BoundedSender;
use crate::tailer::error::{Error, Result};
use crate::tailer::processor::Fields;

/// A finished log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub source: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub status: String,
    pub fields: Fields,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Record {
    pub fn message(&self) -> Option<&str> {
        self.fields.get("message").and_then(|v| v.as_str())
    }
}

/// Transport for records. Failures are reported to the caller, which logs
/// and drops the record; retrying is up to the implementation.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn forward(&self, record: Record) -> Result<()>;
}

/// Hands records to an in-process consumer through a bounded channel.
pub struct ChannelSink {
    tx: BoundedSender<Record>,
}

impl ChannelSink {
    pub fn new(tx: BoundedSender<Record>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn forward(&self, record: Record) -> Result<()> {
        self.tx.send(record).await.map_err(|_| Error::ChannelSend)
    }
}

/// Writes each record to stdout as one JSON line.
pub struct StdoutSink {
    out: Mutex<Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn forward(&self, record: Record) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| Error::Sink(format!("failed to write record: {}", e)))?;
        out.flush()
            .await
            .map_err(|e| Error::Sink(format!("failed to flush stdout: {}", e)))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Collects records in memory; can be told to fail.
    #[derive(Default)]
    pub struct MockSink {
        pub records: StdMutex<Vec<Record>>,
        pub fail: portable_atomic::AtomicBool,
    }

    impl MockSink {
        pub fn records(&self) -> Vec<Record> {
            self.records.lock().unwrap().clone()
        }

        pub fn messages(&self) -> Vec<String> {
            self.records()
                .iter()
                .filter_map(|r| r.message().map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl Sink for MockSink {
        async fn forward(&self, record: Record) -> Result<()> {
            if self.fail.load(portable_atomic::Ordering::SeqCst) {
                return Err(Error::Sink("mock failure".to_string()));
            }
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }
}
