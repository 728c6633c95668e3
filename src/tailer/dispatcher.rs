// SPDX-License-Identifier: Apache-2.0

//! Turns finished text records into [`Record`]s and hands them to the sink.
//!
//! For every record the dispatcher runs the processor, enforces field size
//! limits, normalizes `status`, applies the ignore list, settles the
//! timestamp and attaches tags.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use portable_atomic::{AtomicBool, Ordering};
use serde_json::Value;
use tracing::{debug, warn};

use crate::tailer::config::TailerConfig;
use crate::tailer::error::{Error, Result};
use crate::tailer::processor::{FIELD_MESSAGE, Fields, Processor, message_only};
use crate::tailer::sink::{Record, Sink};

/// Longest value, in bytes, a single field may hold.
pub const MAX_FIELD_LENGTH: usize = 32766;

pub const DEFAULT_STATUS: &str = "info";

const FIELD_STATUS: &str = "status";
const FIELD_TIME: &str = "time";

// Wall-clock timestamps of one file are spaced at least this far apart so
// viewers ordering by time show lines in read order.
const TIME_STEP_NANOS: i64 = 1_000;

/// Map a raw status value to its canonical name. Missing, non-string and
/// unrecognized values become `info`.
pub fn normalize_status(raw: Option<&Value>) -> &'static str {
    let Some(Value::String(s)) = raw else {
        return DEFAULT_STATUS;
    };

    match s.trim().to_lowercase().as_str() {
        "f" | "emerg" => "emerg",
        "a" | "alert" => "alert",
        "c" | "critical" => "critical",
        "e" | "error" => "error",
        "w" | "warning" => "warning",
        "i" | "info" => "info",
        "d" | "trace" | "verbose" | "debug" => "debug",
        "o" | "s" | "ok" => "OK",
        _ => DEFAULT_STATUS,
    }
}

/// Truncate a string `message` and reject any other field longer than
/// [`MAX_FIELD_LENGTH`]. Arrays and objects are measured as serialized JSON.
pub fn check_field_lengths(fields: &mut Fields) -> Result<()> {
    for (key, value) in fields.iter_mut() {
        let len = match &*value {
            Value::String(s) => s.len(),
            v @ (Value::Array(_) | Value::Object(_)) => serde_json::to_vec(v)?.len(),
            _ => continue,
        };
        if len <= MAX_FIELD_LENGTH {
            continue;
        }

        match value {
            Value::String(s) if key == FIELD_MESSAGE => {
                let mut end = MAX_FIELD_LENGTH;
                while !s.is_char_boundary(end) {
                    end -= 1;
                }
                s.truncate(end);
            }
            _ => {
                return Err(Error::Field(format!(
                    "field {:?} is {} bytes, exceeding the limit of {}",
                    key, len, MAX_FIELD_LENGTH
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    /// Forwarding is paused; the record counts as handled.
    Paused,
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    NoFields,
    IgnoredStatus(String),
}

/// Where in the file a record came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceMeta {
    pub offset: u64,
    pub inode: Option<u64>,
}

/// Settings shared by the dispatchers of every tailed file.
pub struct DispatchSettings {
    pub source: String,
    pub service: String,
    pub pipeline: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub ignore_status: HashSet<String>,
    pub disable_add_status_field: bool,
    pub enable_debug_fields: bool,
    pub field_whitelist: HashSet<String>,
    pub processor: Option<Arc<dyn Processor>>,
    pub sink: Arc<dyn Sink>,
    pub paused: Arc<AtomicBool>,
}

impl DispatchSettings {
    pub fn from_config(
        config: &TailerConfig,
        processor: Option<Arc<dyn Processor>>,
        sink: Arc<dyn Sink>,
        paused: Arc<AtomicBool>,
    ) -> Self {
        let service = config.service_name().to_string();
        let mut tags = config.tags.clone();
        tags.insert("service".to_string(), service.clone());

        Self {
            source: config.source.clone(),
            service,
            pipeline: config.pipeline.clone(),
            tags,
            ignore_status: config
                .ignore_status
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            disable_add_status_field: config.disable_add_status_field,
            enable_debug_fields: config.enable_debug_fields,
            field_whitelist: config.field_whitelist.iter().cloned().collect(),
            processor,
            sink,
            paused,
        }
    }

    fn should_add_field(&self, name: &str) -> bool {
        self.field_whitelist.is_empty() || self.field_whitelist.contains(name)
    }
}

/// Per-file dispatcher.
pub struct Dispatcher {
    settings: Arc<DispatchSettings>,
    path: String,
    tags: BTreeMap<String, String>,
    read_lines: u64,
    last_timestamp: i64,
}

impl Dispatcher {
    pub fn new(settings: Arc<DispatchSettings>, path: &Path) -> Self {
        let mut tags = settings.tags.clone();
        if let Some(name) = path.file_name() {
            tags.entry("filename".to_string())
                .or_insert_with(|| name.to_string_lossy().to_string());
        }

        Self {
            path: path.display().to_string(),
            settings,
            tags,
            read_lines: 0,
            last_timestamp: 0,
        }
    }

    /// Lines handled so far, including dropped and paused ones.
    pub fn read_lines(&self) -> u64 {
        self.read_lines
    }

    /// Build the record for `text` and forward it unless it is dropped or
    /// forwarding is paused. Field-limit and sink failures are returned as
    /// errors; they affect this record only.
    pub async fn forward(&mut self, text: &str, meta: &SourceMeta) -> Result<Outcome> {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let record = match self.build(text, meta, now)? {
            Ok(record) => record,
            Err(reason) => {
                debug!(path = %self.path, ?reason, "Dropping record");
                return Ok(Outcome::Dropped(reason));
            }
        };

        if self.settings.paused.load(Ordering::Acquire) {
            return Ok(Outcome::Paused);
        }

        self.settings.sink.forward(record).await?;
        Ok(Outcome::Forwarded)
    }

    fn build(
        &mut self,
        text: &str,
        meta: &SourceMeta,
        now_nanos: i64,
    ) -> Result<std::result::Result<Record, DropReason>> {
        self.read_lines += 1;
        let settings = self.settings.clone();

        let mut fields = match &settings.processor {
            Some(processor) => match processor.run(text) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(path = %self.path, processor = processor.name(), error = %e, "Processor failed, forwarding raw text");
                    message_only(text)
                }
            },
            None => message_only(text),
        };

        if fields.is_empty() {
            return Ok(Err(DropReason::NoFields));
        }

        check_field_lengths(&mut fields)?;

        let status = if settings.disable_add_status_field {
            match fields.get(FIELD_STATUS) {
                Some(Value::String(s)) => s.clone(),
                _ => DEFAULT_STATUS.to_string(),
            }
        } else {
            let status = normalize_status(fields.get(FIELD_STATUS)).to_string();
            fields.insert(FIELD_STATUS.to_string(), Value::String(status.clone()));
            status
        };

        if settings.ignore_status.contains(&status.to_lowercase()) {
            return Ok(Err(DropReason::IgnoredStatus(status)));
        }

        let timestamp = match self.take_time(&mut fields) {
            Some(ts) => ts,
            None => {
                let ts = now_nanos.max(self.last_timestamp + TIME_STEP_NANOS);
                self.last_timestamp = ts;
                ts
            }
        };

        if settings.should_add_field("filepath") {
            fields.insert("filepath".to_string(), Value::String(self.path.clone()));
        }
        if settings.should_add_field("log_read_lines") {
            fields.insert("log_read_lines".to_string(), Value::from(self.read_lines));
        }
        if settings.enable_debug_fields {
            fields.insert("log_read_offset".to_string(), Value::from(meta.offset));
            fields.insert(
                "log_file_inode".to_string(),
                meta.inode.map(Value::from).unwrap_or(Value::Null),
            );
        }

        Ok(Ok(Record {
            source: settings.source.clone(),
            service: settings.service.clone(),
            pipeline: settings.pipeline.clone(),
            tags: self.tags.clone(),
            status,
            fields,
            timestamp,
        }))
    }

    /// Remove `time` from the fields and return it when it is an integer
    /// nanosecond timestamp.
    fn take_time(&self, fields: &mut Fields) -> Option<i64> {
        match fields.remove(FIELD_TIME)? {
            Value::Number(n) if n.as_i64().is_some() => n.as_i64(),
            other => {
                warn!(path = %self.path, value = %other, "Ignoring non-integer time field");
                None
            }
        }
    }
}
