// SPDX-License-Identifier: Apache-2.0

//! Framing of physical lines written by container runtimes.
//!
//! In `file` mode a line is the log text itself. Docker's `json-file` driver
//! wraps every line in a JSON object and CRI runtimes prefix it with a
//! timestamp, stream and tag. Both split long lines into partial pieces that
//! [`LineAssembler`] joins back together before multiline aggregation.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::tailer::error::{Error, Result};
use crate::tailer::splitter::RawLine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextMode {
    #[default]
    File,
    DockerJson,
    #[serde(alias = "cri")]
    CriLog,
}

impl fmt::Display for TextMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TextMode::File => "file",
            TextMode::DockerJson => "docker-json",
            TextMode::CriLog => "cri-log",
        })
    }
}

impl FromStr for TextMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" | "" => Ok(TextMode::File),
            "docker-json" | "docker" => Ok(TextMode::DockerJson),
            "cri-log" | "cri" => Ok(TextMode::CriLog),
            _ => Err(format!(
                "Invalid text mode '{}'. Valid options: file, docker-json, cri-log",
                s
            )),
        }
    }
}

/// Log text carried by one physical line.
#[derive(Debug, PartialEq, Eq)]
pub struct LogMessage<'a> {
    pub log: Cow<'a, [u8]>,
    /// More pieces of the same line follow.
    pub partial: bool,
}

#[derive(Deserialize)]
struct DockerLine {
    log: String,
}

pub fn parse(mode: TextMode, line: &[u8]) -> Result<LogMessage<'_>> {
    match mode {
        TextMode::File => Ok(LogMessage {
            log: Cow::Borrowed(line),
            partial: false,
        }),
        TextMode::DockerJson => parse_docker_json(line),
        TextMode::CriLog => parse_cri(line),
    }
}

/// `{"log":"text\n","stream":"stdout","time":"..."}`. A `log` value without
/// the trailing newline is a partial piece.
fn parse_docker_json(line: &[u8]) -> Result<LogMessage<'_>> {
    let entry: DockerLine = serde_json::from_slice(line)?;
    let mut log = entry.log.into_bytes();

    let partial = !log.ends_with(b"\n");
    if !partial {
        log.pop();
    }
    Ok(LogMessage {
        log: Cow::Owned(log),
        partial,
    })
}

/// `<time> <stream> <tag> <content>`, where the first tag is `P` for a
/// partial piece and `F` for the last one.
fn parse_cri(line: &[u8]) -> Result<LogMessage<'_>> {
    let mut parts = line.splitn(4, |b| *b == b' ');
    let (Some(_time), Some(_stream), Some(tags)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Parse(format!(
            "cri log line has too few fields: {:?}",
            String::from_utf8_lossy(line)
        )));
    };

    let partial = match tags.split(|b| *b == b':').next() {
        Some(b"P") => true,
        Some(b"F") => false,
        _ => {
            return Err(Error::Parse(format!(
                "unknown cri log tag {:?}",
                String::from_utf8_lossy(tags)
            )));
        }
    };

    Ok(LogMessage {
        log: Cow::Borrowed(parts.next().unwrap_or_default()),
        partial,
    })
}

/// Joins partial pieces into whole lines, keeping count of the file bytes
/// they covered.
#[derive(Debug)]
pub struct LineAssembler {
    mode: TextMode,
    max_size: usize,
    buffer: Vec<u8>,
    raw_len: usize,
}

impl LineAssembler {
    pub fn new(mode: TextMode, max_size: usize) -> Self {
        Self {
            mode,
            max_size: max_size.max(1),
            buffer: Vec::new(),
            raw_len: 0,
        }
    }

    /// Feed one physical line. Returns the whole line once its last piece
    /// arrived, `None` while pieces are still missing. A joined line longer
    /// than `max_size` is released early.
    pub fn push(&mut self, line: RawLine) -> Result<Option<RawLine>> {
        if self.mode == TextMode::File || line.bytes.is_empty() {
            return Ok(Some(line));
        }

        let message = parse(self.mode, &line.bytes)?;
        self.buffer.extend_from_slice(&message.log);
        self.raw_len += line.consumed;

        if message.partial && self.buffer.len() < self.max_size {
            return Ok(None);
        }
        Ok(self.take())
    }

    /// Count file bytes passed over while a line is being joined. Returns
    /// false when nothing is held, leaving the bytes to the caller.
    pub fn absorb(&mut self, raw_len: usize) -> bool {
        if self.raw_len == 0 {
            return false;
        }
        self.raw_len += raw_len;
        true
    }

    pub fn pending_raw_len(&self) -> usize {
        self.raw_len
    }

    /// Whatever pieces are held, as one line. Used when the file ends.
    pub fn finish(&mut self) -> Option<RawLine> {
        self.take()
    }

    fn take(&mut self) -> Option<RawLine> {
        if self.raw_len == 0 {
            return None;
        }
        Some(RawLine {
            bytes: std::mem::take(&mut self.buffer),
            consumed: std::mem::replace(&mut self.raw_len, 0),
        })
    }
}
