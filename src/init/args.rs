// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tower::BoxError;

use crate::init::parse::{deser_key_vals, deser_pattern_list, deser_string_list, parse_key_val};
use crate::tailer::config::{DEFAULT_FILE_SIZE_THRESHOLD, ProcessorType, TailerConfig};
use crate::tailer::textparser::TextMode;
use crate::tailer::watcher::WatchMode;

/// Processor applied to each record
#[derive(Copy, Clone, Debug, Default, ValueEnum, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorArg {
    /// No processing, the record text becomes `message`
    #[default]
    None,
    /// Parse records as JSON objects
    Json,
    /// Extract named capture groups of --regex-pattern
    Regex,
}

impl From<ProcessorArg> for ProcessorType {
    fn from(p: ProcessorArg) -> Self {
        match p {
            ProcessorArg::None => ProcessorType::None,
            ProcessorArg::Json => ProcessorType::Json,
            ProcessorArg::Regex => ProcessorType::Regex,
        }
    }
}

/// How each line of a file is framed
#[derive(Copy, Clone, Debug, Default, ValueEnum, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TextModeArg {
    /// Plain text lines
    #[default]
    File,
    /// Docker json-file driver output
    DockerJson,
    /// CRI runtime log format (containerd, CRI-O)
    CriLog,
}

impl From<TextModeArg> for TextMode {
    fn from(m: TextModeArg) -> Self {
        match m {
            TextModeArg::File => TextMode::File,
            TextModeArg::DockerJson => TextMode::DockerJson,
            TextModeArg::CriLog => TextMode::CriLog,
        }
    }
}

/// Watch mode for file system monitoring
#[derive(Copy, Clone, Debug, Default, ValueEnum, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WatchModeArg {
    /// Native notifications, falling back to polling
    #[default]
    Auto,
    /// Force native file system watching (inotify/kqueue/FSEvents)
    Native,
    /// Force polling mode (use for NFS or when native watching is unreliable)
    Poll,
}

impl From<WatchModeArg> for WatchMode {
    fn from(w: WatchModeArg) -> Self {
        match w {
            WatchModeArg::Auto => WatchMode::Auto,
            WatchModeArg::Native => WatchMode::Native,
            WatchModeArg::Poll => WatchMode::Poll,
        }
    }
}

#[derive(Debug, Args, Clone, Deserialize)]
#[serde(default)]
pub struct TailerArgs {
    /// Load options from a TOML file (LOGTAIL_* variables override it, flags are ignored)
    #[arg(long, env = "LOGTAIL_CONFIG")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Comma-separated glob patterns for files to tail (e.g., "/var/log/*.log,/tmp/*.log")
    #[arg(long, env = "LOGTAIL_INCLUDE", value_delimiter = ',')]
    #[serde(deserialize_with = "deser_string_list")]
    pub include: Vec<String>,

    /// Comma-separated glob patterns for files to skip
    #[arg(long, env = "LOGTAIL_IGNORE", value_delimiter = ',')]
    #[serde(deserialize_with = "deser_string_list")]
    pub ignore: Vec<String>,

    /// Source name reported on every record
    #[arg(long, env = "LOGTAIL_SOURCE", default_value = "default")]
    pub source: String,

    /// Service name, defaults to the source
    #[arg(long, env = "LOGTAIL_SERVICE", default_value = "")]
    pub service: String,

    /// Pipeline name reported on every record
    #[arg(long, env = "LOGTAIL_PIPELINE")]
    pub pipeline: Option<String>,

    /// Processor: none, json, regex
    #[arg(value_enum, long, env = "LOGTAIL_PROCESSOR", default_value = "none")]
    pub processor: ProcessorArg,

    /// Regex pattern with named capture groups (when processor=regex)
    #[arg(long, env = "LOGTAIL_REGEX_PATTERN")]
    pub regex_pattern: Option<String>,

    /// Character encoding of the files: utf-8, utf-16le, utf-16be, gbk, gb18030
    #[arg(long, env = "LOGTAIL_CHARACTER_ENCODING", default_value = "")]
    pub character_encoding: String,

    /// Line framing: file, docker-json, cri-log
    #[arg(value_enum, long, env = "LOGTAIL_TEXT_MODE", default_value = "file")]
    pub text_mode: TextModeArg,

    /// Regex matching the first line of a multiline record (repeat for more patterns)
    #[arg(long, env = "LOGTAIL_MULTILINE_MATCH")]
    #[serde(deserialize_with = "deser_pattern_list")]
    pub multiline_match: Vec<String>,

    /// Maximum number of lines in one multiline record
    #[arg(long, env = "LOGTAIL_MAX_MULTILINE_LINES", default_value = "30")]
    pub max_multiline_lines: usize,

    /// Maximum time in milliseconds a multiline record stays open (0 disables)
    #[arg(
        long,
        env = "LOGTAIL_MAX_MULTILINE_LIFETIME_MS",
        default_value = "3000"
    )]
    pub max_multiline_lifetime_ms: u64,

    /// Longest unterminated line in bytes before it is cut
    #[arg(long, env = "LOGTAIL_MAX_LINE_SIZE", default_value = "65536")]
    pub max_line_size: usize,

    /// Read new files from the beginning instead of the end
    #[arg(long, env = "LOGTAIL_FROM_BEGINNING", default_value = "false")]
    pub from_beginning: bool,

    /// New files smaller than this many bytes are read from the beginning (0 disables)
    #[arg(long, env = "LOGTAIL_FILE_SIZE_THRESHOLD", default_value = "20000000")]
    pub file_size_threshold: u64,

    /// Comma-separated statuses whose records are dropped
    #[arg(long, env = "LOGTAIL_IGNORE_STATUS", value_delimiter = ',')]
    #[serde(deserialize_with = "deser_string_list")]
    pub ignore_status: Vec<String>,

    /// Do not normalize or add the status field
    #[arg(long, env = "LOGTAIL_DISABLE_ADD_STATUS_FIELD", default_value = "false")]
    pub disable_add_status_field: bool,

    /// Strip ANSI escape sequences from lines
    #[arg(long, env = "LOGTAIL_REMOVE_ANSI_ESCAPE_CODES", default_value = "false")]
    pub remove_ansi_escape_codes: bool,

    /// Add log_read_offset and log_file_inode to every record
    #[arg(long, env = "LOGTAIL_ENABLE_DEBUG_FIELDS", default_value = "false")]
    pub enable_debug_fields: bool,

    /// Comma-separated list restricting which generated fields are added
    #[arg(long, env = "LOGTAIL_FIELD_WHITELIST", value_delimiter = ',')]
    #[serde(deserialize_with = "deser_string_list")]
    pub field_whitelist: Vec<String>,

    /// Maximum number of files tailed at once (-1 for unlimited)
    #[arg(
        long,
        env = "LOGTAIL_MAX_OPEN_FILES",
        default_value = "500",
        allow_negative_numbers = true
    )]
    pub max_open_files: i64,

    /// Release files not modified for this many milliseconds
    #[arg(long, env = "LOGTAIL_IGNORE_DEAD_LOG_MS")]
    pub ignore_dead_log_ms: Option<u64>,

    /// Comma-separated, key=value pairs of tags to set on every record
    #[arg(long, env = "LOGTAIL_TAGS", value_parser = parse_key_val::<String, String>, value_delimiter = ',')]
    #[serde(deserialize_with = "deser_key_vals")]
    pub tags: Vec<(String, String)>,

    /// Path to store file offsets for persistence across restarts
    #[arg(
        long,
        env = "LOGTAIL_OFFSETS_PATH",
        default_value = "/var/lib/logtail/offsets.json"
    )]
    pub offsets_path: PathBuf,

    /// Watch mode: auto (default), native (inotify/kqueue/FSEvents), poll (for NFS)
    #[arg(value_enum, long, env = "LOGTAIL_WATCH_MODE", default_value = "auto")]
    pub watch_mode: WatchModeArg,

    /// Poll interval in milliseconds (poll watch mode)
    #[arg(long, env = "LOGTAIL_POLL_INTERVAL_MS", default_value = "1000")]
    pub poll_interval_ms: u64,

    /// Interval in milliseconds between glob scans for new files
    #[arg(long, env = "LOGTAIL_DISCOVERY_INTERVAL_MS", default_value = "10000")]
    pub discovery_interval_ms: u64,

    /// Interval in milliseconds between checks for deleted files
    #[arg(long, env = "LOGTAIL_SWEEP_INTERVAL_MS", default_value = "5000")]
    pub sweep_interval_ms: u64,

    /// Time in milliseconds a reader waits at end of file before reading again
    #[arg(long, env = "LOGTAIL_WAIT_INTERVAL_MS", default_value = "1000")]
    pub wait_interval_ms: u64,

    /// Chunks buffered between a file's reader and its forwarder
    #[arg(long, env = "LOGTAIL_READER_BUFFER", default_value = "16")]
    pub reader_buffer: usize,

    /// Interval in milliseconds between checkpoint writes
    #[arg(long, env = "LOGTAIL_CHECKPOINT_INTERVAL_MS", default_value = "1000")]
    pub checkpoint_interval_ms: u64,

    /// Maximum time in milliseconds to wait for files to stop during shutdown
    #[arg(long, env = "LOGTAIL_SHUTDOWN_GRACE_MS", default_value = "2000")]
    pub shutdown_grace_ms: u64,
}

impl Default for TailerArgs {
    fn default() -> Self {
        Self {
            config: None,
            include: Vec::new(),
            ignore: Vec::new(),
            source: "default".to_string(),
            service: String::new(),
            pipeline: None,
            processor: ProcessorArg::None,
            regex_pattern: None,
            character_encoding: String::new(),
            text_mode: TextModeArg::File,
            multiline_match: Vec::new(),
            max_multiline_lines: 30,
            max_multiline_lifetime_ms: 3000,
            max_line_size: 65536,
            from_beginning: false,
            file_size_threshold: DEFAULT_FILE_SIZE_THRESHOLD,
            ignore_status: Vec::new(),
            disable_add_status_field: false,
            remove_ansi_escape_codes: false,
            enable_debug_fields: false,
            field_whitelist: Vec::new(),
            max_open_files: 500,
            ignore_dead_log_ms: None,
            tags: Vec::new(),
            offsets_path: PathBuf::from("/var/lib/logtail/offsets.json"),
            watch_mode: WatchModeArg::Auto,
            poll_interval_ms: 1000,
            discovery_interval_ms: 10000,
            sweep_interval_ms: 5000,
            wait_interval_ms: 1000,
            reader_buffer: 16,
            checkpoint_interval_ms: 1000,
            shutdown_grace_ms: 2000,
        }
    }
}

impl TailerArgs {
    /// Build the tailer config from command line args
    pub fn build_config(&self) -> TailerConfig {
        TailerConfig {
            include: self.include.clone(),
            ignore: self.ignore.clone(),
            source: self.source.clone(),
            service: self.service.clone(),
            pipeline: self.pipeline.clone().filter(|p| !p.is_empty()),
            processor: self.processor.into(),
            regex_pattern: self.regex_pattern.clone(),
            character_encoding: self.character_encoding.clone(),
            text_mode: self.text_mode.into(),
            multiline_match: self.multiline_match.clone(),
            max_multiline_lines: self.max_multiline_lines,
            max_multiline_lifetime: Duration::from_millis(self.max_multiline_lifetime_ms),
            max_line_size: self.max_line_size,
            from_beginning: self.from_beginning,
            file_size_threshold: self.file_size_threshold,
            ignore_status: self.ignore_status.clone(),
            disable_add_status_field: self.disable_add_status_field,
            remove_ansi_escape_codes: self.remove_ansi_escape_codes,
            enable_debug_fields: self.enable_debug_fields,
            field_whitelist: self.field_whitelist.clone(),
            max_open_files: self.max_open_files,
            ignore_dead_log: self
                .ignore_dead_log_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            tags: self.tags.iter().cloned().collect(),
            watch_mode: self.watch_mode.into(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            discovery_interval: Duration::from_millis(self.discovery_interval_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            wait_interval: Duration::from_millis(self.wait_interval_ms),
            reader_buffer: self.reader_buffer,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }

    /// Checks for the options that stay outside [`TailerConfig`].
    pub fn validate(&self) -> Result<(), BoxError> {
        if self.checkpoint_interval_ms == 0 {
            return Err("checkpoint_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        tailer: TailerArgs,
    }

    #[test]
    fn test_flag_defaults_match_default_impl() {
        let cli = TestCli::try_parse_from(["logtail"]).unwrap();
        let parsed = cli.tailer.build_config();
        let defaults = TailerArgs::default().build_config();

        assert_eq!(parsed.source, defaults.source);
        assert_eq!(parsed.max_multiline_lines, defaults.max_multiline_lines);
        assert_eq!(parsed.max_open_files, defaults.max_open_files);
        assert_eq!(parsed.discovery_interval, defaults.discovery_interval);
        assert_eq!(parsed.shutdown_grace, defaults.shutdown_grace);
        assert_eq!(parsed.file_size_threshold, defaults.file_size_threshold);
        assert_eq!(parsed.text_mode, defaults.text_mode);
        assert_eq!(cli.tailer.offsets_path, TailerArgs::default().offsets_path);
    }

    #[test]
    fn test_build_config() {
        let cli = TestCli::try_parse_from([
            "logtail",
            "--include",
            "/var/log/*.log,/tmp/*.log",
            "--source",
            "nginx",
            "--processor",
            "json",
            "--tags",
            "env=prod,team=web",
            "--max-open-files",
            "-1",
            "--ignore-dead-log-ms",
            "60000",
            "--watch-mode",
            "poll",
            "--from-beginning",
            "--text-mode",
            "cri-log",
            "--multiline-match",
            r"^\d{4}-\d{2}-\d{2}",
            "--multiline-match",
            r"^\[\w+\],x{1,3}",
        ])
        .unwrap();

        let config = cli.tailer.build_config();
        assert_eq!(config.include, vec!["/var/log/*.log", "/tmp/*.log"]);
        assert_eq!(config.service_name(), "nginx");
        assert_eq!(config.processor, ProcessorType::Json);
        assert_eq!(config.tags["env"], "prod");
        assert_eq!(config.tags["team"], "web");
        assert_eq!(config.max_open_files(), None);
        assert_eq!(config.ignore_dead_log, Some(Duration::from_secs(60)));
        assert_eq!(config.watch_mode, WatchMode::Poll);
        assert!(config.from_beginning);
        assert_eq!(config.text_mode, TextMode::CriLog);
        // commas inside a pattern are kept
        assert_eq!(
            config.multiline_match,
            vec![r"^\d{4}-\d{2}-\d{2}", r"^\[\w+\],x{1,3}"]
        );
        assert!(config.validate().is_ok());
        assert!(cli.tailer.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_checkpoint_interval() {
        let args = TailerArgs {
            checkpoint_interval_ms: 0,
            ..Default::default()
        };
        assert!(args.validate().is_err());
    }
}
