// SPDX-License-Identifier: Apache-2.0

//! Aggregation of physical lines into logical multiline records.
//!
//! A line matching any configured start pattern opens a record; every
//! following line that matches none of them is appended to it. The accumulator is
//! flushed when the next start line arrives, when it holds `max_lines` lines,
//! or when it has been open longer than `max_lifetime`, whichever comes first.

use std::time::{Duration, Instant};

use regex::RegexSet;

use crate::tailer::error::{Error, Result};

pub const DEFAULT_MAX_LINES: usize = 30;
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct Multiline {
    patterns: Option<RegexSet>,
    max_lines: usize,
    max_lifetime: Duration,
    buffer: String,
    line_count: usize,
    raw_len: usize,
    started_at: Option<Instant>,
}

impl Multiline {
    /// Build an aggregator. Blank patterns are ignored; with none left,
    /// aggregation is disabled.
    pub fn new(patterns: &[String], max_lines: usize, max_lifetime: Duration) -> Result<Self> {
        let patterns: Vec<&str> = patterns
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        let patterns = if patterns.is_empty() {
            None
        } else {
            Some(
                RegexSet::new(patterns)
                    .map_err(|e| Error::Regex(format!("invalid multiline pattern: {}", e)))?,
            )
        };

        Ok(Self {
            patterns,
            max_lines: if max_lines == 0 {
                DEFAULT_MAX_LINES
            } else {
                max_lines
            },
            max_lifetime,
            buffer: String::new(),
            line_count: 0,
            raw_len: 0,
            started_at: None,
        })
    }

    /// Feed one line, returning a finished record when one is complete.
    pub fn process(&mut self, line: &str) -> Option<String> {
        self.process_at(line, 0, Instant::now())
    }

    /// Like [`Multiline::process`], tracking how many file bytes the line
    /// covered and when it was read.
    pub fn process_at(&mut self, line: &str, raw_len: usize, now: Instant) -> Option<String> {
        let Some(patterns) = &self.patterns else {
            return Some(line.to_string());
        };
        if self.max_lines == 1 {
            return Some(line.to_string());
        }

        if patterns.is_match(line) {
            let previous = self.flush();
            self.append(line, raw_len, now);
            return previous;
        }

        self.append(line, raw_len, now);
        if self.line_count >= self.max_lines {
            return self.flush();
        }
        None
    }

    /// Flush the accumulator if it has outlived the configured lifetime.
    pub fn take_expired(&mut self, now: Instant) -> Option<String> {
        if self.max_lifetime.is_zero() {
            return None;
        }
        match self.started_at {
            Some(started) if now.saturating_duration_since(started) >= self.max_lifetime => {
                self.flush()
            }
            _ => None,
        }
    }

    /// Return whatever is accumulated and reset.
    pub fn flush(&mut self) -> Option<String> {
        if self.line_count == 0 {
            return None;
        }
        self.line_count = 0;
        self.raw_len = 0;
        self.started_at = None;
        Some(std::mem::take(&mut self.buffer))
    }

    /// File bytes covered by lines that have not been emitted yet.
    pub fn pending_raw_len(&self) -> usize {
        self.raw_len
    }

    /// Account for file bytes passed over (such as blank lines) while a
    /// record is open, so they are not checkpointed ahead of it.
    pub fn skip(&mut self, raw_len: usize) {
        if self.line_count > 0 {
            self.raw_len += raw_len;
        }
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    /// Time at which the open accumulator expires, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        if self.max_lifetime.is_zero() {
            return None;
        }
        self.started_at.map(|s| s + self.max_lifetime)
    }

    fn append(&mut self, line: &str, raw_len: usize, now: Instant) {
        if self.line_count > 0 {
            self.buffer.push('\n');
        } else {
            self.started_at = Some(now);
        }
        self.buffer.push_str(line);
        self.line_count += 1;
        self.raw_len += raw_len;
    }
}
