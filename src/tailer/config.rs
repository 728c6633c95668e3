// SPDX-License-Identifier: Apache-2.0

//! Configuration for the tailer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::tailer::decoder::Decoder;
use crate::tailer::error::{Error, Result};
use crate::tailer::multiline::{DEFAULT_MAX_LIFETIME, DEFAULT_MAX_LINES, Multiline};
use crate::tailer::processor::{JsonProcessor, Processor, RegexProcessor};
use crate::tailer::textparser::TextMode;
use crate::tailer::watcher::WatchMode;

pub const DEFAULT_SOURCE: &str = "default";
pub const DEFAULT_MAX_OPEN_FILES: i64 = 500;
pub const DEFAULT_MAX_LINE_SIZE: usize = 64 * 1024;
pub const DEFAULT_FILE_SIZE_THRESHOLD: u64 = 20 * 1000 * 1000;

/// Built-in processors selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessorType {
    #[default]
    None,
    Json,
    Regex,
}

#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Glob patterns for files to tail
    pub include: Vec<String>,
    /// Glob patterns for files to skip
    pub ignore: Vec<String>,
    pub source: String,
    /// Defaults to `source` when empty
    pub service: String,
    /// Pipeline name reported on records
    pub pipeline: Option<String>,
    pub processor: ProcessorType,
    /// Pattern with named capture groups (when processor is Regex)
    pub regex_pattern: Option<String>,
    pub character_encoding: String,
    /// How each line is framed: plain text or a container runtime log format
    pub text_mode: TextMode,
    /// Regexes marking the first line of a multiline record; any match starts one
    pub multiline_match: Vec<String>,
    pub max_multiline_lines: usize,
    pub max_multiline_lifetime: Duration,
    /// Longest unterminated line kept before it is cut
    pub max_line_size: usize,
    pub from_beginning: bool,
    /// Files smaller than this are read from the start when first seen (0 disables)
    pub file_size_threshold: u64,
    pub ignore_status: Vec<String>,
    pub disable_add_status_field: bool,
    pub remove_ansi_escape_codes: bool,
    /// Adds `log_read_offset` and `log_file_inode` to every record
    pub enable_debug_fields: bool,
    /// When non-empty, only these of the generated fields are added
    pub field_whitelist: Vec<String>,
    /// 0 or -1 for unlimited
    pub max_open_files: i64,
    /// Release files not modified for this long
    pub ignore_dead_log: Option<Duration>,
    pub tags: BTreeMap<String, String>,
    pub watch_mode: WatchMode,
    pub poll_interval: Duration,
    pub discovery_interval: Duration,
    pub sweep_interval: Duration,
    pub wait_interval: Duration,
    /// Chunks buffered between a file's reader and its forwarder
    pub reader_buffer: usize,
    pub shutdown_grace: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            ignore: Vec::new(),
            source: DEFAULT_SOURCE.to_string(),
            service: String::new(),
            pipeline: None,
            processor: ProcessorType::None,
            regex_pattern: None,
            character_encoding: String::new(),
            text_mode: TextMode::File,
            multiline_match: Vec::new(),
            max_multiline_lines: DEFAULT_MAX_LINES,
            max_multiline_lifetime: DEFAULT_MAX_LIFETIME,
            max_line_size: DEFAULT_MAX_LINE_SIZE,
            from_beginning: false,
            file_size_threshold: DEFAULT_FILE_SIZE_THRESHOLD,
            ignore_status: Vec::new(),
            disable_add_status_field: false,
            remove_ansi_escape_codes: false,
            enable_debug_fields: false,
            field_whitelist: Vec::new(),
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            ignore_dead_log: None,
            tags: BTreeMap::new(),
            watch_mode: WatchMode::Auto,
            poll_interval: Duration::from_secs(1),
            discovery_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            wait_interval: Duration::from_secs(1),
            reader_buffer: 16,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TailerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.include.is_empty() {
            return Err(Error::Config(
                "At least one include pattern must be specified".to_string(),
            ));
        }
        if self.source.trim().is_empty() {
            return Err(Error::Config("source cannot be empty".to_string()));
        }
        if self.max_open_files < -1 {
            return Err(Error::Config(format!(
                "max_open_files must be -1 (unlimited) or greater, got {}",
                self.max_open_files
            )));
        }
        if self.max_line_size == 0 {
            return Err(Error::Config("max_line_size must be greater than 0".to_string()));
        }
        if self.reader_buffer == 0 {
            return Err(Error::Config("reader_buffer must be greater than 0".to_string()));
        }
        for (name, interval) in [
            ("poll_interval", self.poll_interval),
            ("discovery_interval", self.discovery_interval),
            ("sweep_interval", self.sweep_interval),
            ("wait_interval", self.wait_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.processor == ProcessorType::Regex && self.regex_pattern.is_none() {
            return Err(Error::Config(
                "Regex pattern must be specified when processor is 'regex'".to_string(),
            ));
        }

        let decoder = Decoder::new(&self.character_encoding)?;
        if self.text_mode != TextMode::File && decoder.charset().is_utf16() {
            return Err(Error::Config(format!(
                "text mode {} cannot read {} files",
                self.text_mode, self.character_encoding
            )));
        }
        self.multiline()?;
        self.build_processor()?;
        Ok(())
    }

    /// `service`, or `source` when no service is set.
    pub fn service_name(&self) -> &str {
        if self.service.trim().is_empty() {
            &self.source
        } else {
            &self.service
        }
    }

    pub fn multiline(&self) -> Result<Multiline> {
        Multiline::new(
            &self.multiline_match,
            self.max_multiline_lines,
            self.max_multiline_lifetime,
        )
    }

    pub fn build_processor(&self) -> Result<Option<Arc<dyn Processor>>> {
        match self.processor {
            ProcessorType::None => Ok(None),
            ProcessorType::Json => Ok(Some(Arc::new(JsonProcessor::lenient()))),
            ProcessorType::Regex => {
                let pattern = self.regex_pattern.as_deref().ok_or_else(|| {
                    Error::Config("Regex pattern must be specified when processor is 'regex'".to_string())
                })?;
                Ok(Some(Arc::new(RegexProcessor::new(pattern)?)))
            }
        }
    }

    /// Cap on concurrently tailed files. 0 and -1 both mean no cap.
    pub fn max_open_files(&self) -> Option<usize> {
        usize::try_from(self.max_open_files).ok().filter(|n| *n > 0)
    }
}
