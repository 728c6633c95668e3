// SPDX-License-Identifier: Apache-2.0

//! Processors turn a finished text record into structured fields.
//!
//! The tailer treats a processor as opaque: it hands over the record text and
//! gets back a field map. When no processor is configured the record becomes
//! a single `message` field.

use regex::Regex;
use serde_json::{Map, Value};

use crate::tailer::error::{Error, Result};

pub type Fields = Map<String, Value>;

pub const FIELD_MESSAGE: &str = "message";

pub trait Processor: Send + Sync {
    fn run(&self, text: &str) -> Result<Fields>;

    /// Name reported on produced records.
    fn name(&self) -> &str;
}

/// Fields for a record when there is no processor.
pub fn message_only(text: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(FIELD_MESSAGE.to_string(), Value::String(text.to_string()));
    fields
}

/// Parses each record as a JSON object. The original text is kept as
/// `message` unless the object already carries one.
#[derive(Debug, Clone, Default)]
pub struct JsonProcessor {
    /// Return only `message` instead of failing on records that are not JSON objects.
    lenient: bool,
}

impl JsonProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lenient() -> Self {
        Self { lenient: true }
    }
}

impl Processor for JsonProcessor {
    fn run(&self, text: &str) -> Result<Fields> {
        let mut fields = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            Ok(_) if self.lenient => return Ok(message_only(text)),
            Ok(_) => {
                return Err(Error::Processor(
                    "JSON must be an object at the top level".to_string(),
                ));
            }
            Err(_) if self.lenient => return Ok(message_only(text)),
            Err(e) => return Err(Error::Processor(format!("invalid JSON: {}", e))),
        };

        fields
            .entry(FIELD_MESSAGE)
            .or_insert_with(|| Value::String(text.to_string()));
        Ok(fields)
    }

    fn name(&self) -> &str {
        "json"
    }
}

/// Extracts named capture groups as string fields.
#[derive(Debug, Clone)]
pub struct RegexProcessor {
    regex: Regex,
    group_names: Vec<String>,
}

impl RegexProcessor {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex =
            Regex::new(pattern).map_err(|e| Error::Regex(format!("invalid regex pattern: {}", e)))?;

        let group_names: Vec<String> = regex
            .capture_names()
            .skip(1)
            .filter_map(|name| name.map(|s| s.to_string()))
            .collect();

        if group_names.is_empty() {
            return Err(Error::Config(
                "regex pattern must contain at least one named capture group (use (?P<name>...) syntax)"
                    .to_string(),
            ));
        }

        Ok(Self { regex, group_names })
    }

    pub fn group_names(&self) -> &[String] {
        &self.group_names
    }
}

impl Processor for RegexProcessor {
    fn run(&self, text: &str) -> Result<Fields> {
        let captures = self.regex.captures(text).ok_or_else(|| {
            Error::Processor(format!(
                "regex pattern does not match input: {:?}",
                text.chars().take(100).collect::<String>()
            ))
        })?;

        let mut fields = message_only(text);
        for name in &self.group_names {
            if let Some(m) = captures.name(name) {
                fields.insert(name.clone(), Value::String(m.as_str().to_string()));
            }
        }
        Ok(fields)
    }

    fn name(&self) -> &str {
        "regex"
    }
}
