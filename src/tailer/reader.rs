// SPDX-License-Identifier: Apache-2.0

//! Incremental reader for a single tailed file.
//!
//! The reader owns one open handle and moves through
//! `Opening -> Reading <-> Waiting -> Closed`. Between read attempts it stats
//! the path to notice rotation (a different file now lives there),
//! truncation (the file shrank below our offset) and removal, since external
//! rotation tools do not reliably produce file system events.

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::tailer::file_id::FileIdentity;

pub const READ_BUFFER_SIZE: usize = 4096;

/// Upper bound on reads performed while draining a file that is going away.
const DRAIN_MAX_READS: usize = 256;

/// One file being tailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailTarget {
    pub path: PathBuf,
    pub file_key: String,
    pub offset: u64,
    pub from_beginning: bool,
    pub inode: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReaderSettings {
    /// Sleep between read attempts once the end of the file is reached.
    pub wait_interval: Duration,
    /// Release files not modified for this long.
    pub ignore_dead_log: Option<Duration>,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            wait_interval: Duration::from_secs(1),
            ignore_dead_log: None,
        }
    }
}

/// Bytes read from the file and the file offset right after them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub bytes: Vec<u8>,
    pub end_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Data(Chunk),
    End(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Stop requested by the tailer.
    Stopped,
    /// A different file now exists at the path.
    Rotated,
    /// The file shrank below the read offset.
    Truncated,
    Removed,
    /// No modification for longer than the dead-file threshold.
    Dead,
    ReadError,
    /// The downstream consumer went away.
    Disconnected,
}

impl ExitReason {
    /// The handle we read from will never receive more data.
    pub fn file_ended(self) -> bool {
        matches!(self, ExitReason::Rotated | ExitReason::Removed)
    }

    /// Bytes after the last delimiter will never be completed.
    pub fn partial_line_final(self) -> bool {
        matches!(
            self,
            ExitReason::Rotated | ExitReason::Removed | ExitReason::Truncated
        )
    }

    /// Content that shows up at the path later should be read from its
    /// first byte.
    pub fn restart_from_beginning(self) -> bool {
        matches!(
            self,
            ExitReason::Rotated | ExitReason::Truncated | ExitReason::Removed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Opening,
    Reading,
    Waiting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileCheck {
    Unchanged,
    Grown,
    Rotated,
    Truncated,
    Removed,
    Dead,
}

enum Emit {
    Sent,
    Disconnected,
    Cancelled,
}

/// Where a new reader should begin.
///
/// A stored checkpoint wins when it still fits in the file. Without one the
/// reader starts at 0 when asked to read from the beginning or when the file
/// is smaller than `size_threshold` (0 disables the threshold), and at the
/// end of the file otherwise. A checkpoint past the end of the file means
/// the file was truncated while we were not watching, so reading restarts
/// at 0.
pub fn start_position(
    checkpoint: Option<u64>,
    size: u64,
    from_beginning: bool,
    size_threshold: u64,
) -> u64 {
    match checkpoint {
        Some(offset) if offset <= size => offset,
        Some(_) => 0,
        None if from_beginning => 0,
        None if size_threshold > 0 && size < size_threshold => 0,
        None => size,
    }
}

pub struct SingleFileReader {
    target: TailTarget,
    identity: Arc<dyn FileIdentity>,
    settings: ReaderSettings,
    state: ReaderState,
}

impl SingleFileReader {
    pub fn new(
        target: TailTarget,
        identity: Arc<dyn FileIdentity>,
        settings: ReaderSettings,
    ) -> Self {
        Self {
            target,
            identity,
            settings,
            state: ReaderState::Opening,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Tail the file until it ends or `cancel` fires. A final
    /// [`ReadEvent::End`] is sent downstream before returning.
    pub async fn run(
        mut self,
        out: BoundedSender<ReadEvent>,
        cancel: CancellationToken,
    ) -> ExitReason {
        let reason = self.tail(&out, &cancel).await;
        self.state = ReaderState::Closed;

        debug!(
            path = ?self.target.path,
            file_key = %self.target.file_key,
            offset = self.target.offset,
            ?reason,
            "Reader closed"
        );

        let end = ReadEvent::End(reason);
        if reason == ExitReason::Stopped {
            let _ = out.try_send(end);
        } else {
            let _ = out.send(end).await;
        }
        reason
    }

    async fn tail(&mut self, out: &BoundedSender<ReadEvent>, cancel: &CancellationToken) -> ExitReason {
        let mut file = match self.open().await {
            Ok(Some(f)) => f,
            Ok(None) => return ExitReason::Rotated,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return ExitReason::Removed,
            Err(e) => {
                warn!(path = ?self.target.path, error = %e, "Failed to open file");
                return ExitReason::ReadError;
            }
        };
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        self.state = ReaderState::Reading;

        loop {
            if cancel.is_cancelled() {
                return match self.drain(&mut file, &mut buf, out, cancel).await {
                    Some(reason) => reason,
                    None => ExitReason::Stopped,
                };
            }

            match self.state {
                ReaderState::Reading => match file.read(&mut buf).await {
                    Ok(0) => self.state = ReaderState::Waiting,
                    Ok(n) => match self.emit(&buf[..n], out, cancel).await {
                        Emit::Sent => {}
                        Emit::Disconnected => return ExitReason::Disconnected,
                        Emit::Cancelled => return ExitReason::Stopped,
                    },
                    Err(e) => {
                        warn!(path = ?self.target.path, error = %e, "Failed to read file");
                        return ExitReason::ReadError;
                    }
                },
                ReaderState::Waiting => {
                    tokio::select! {
                        _ = cancel.cancelled() => continue,
                        _ = tokio::time::sleep(self.settings.wait_interval) => {}
                    }

                    match self.inspect().await {
                        FileCheck::Unchanged | FileCheck::Grown => self.state = ReaderState::Reading,
                        FileCheck::Rotated => {
                            info!(path = ?self.target.path, "File rotated");
                            return self
                                .drain(&mut file, &mut buf, out, cancel)
                                .await
                                .unwrap_or(ExitReason::Rotated);
                        }
                        FileCheck::Removed => {
                            info!(path = ?self.target.path, "File removed");
                            return self
                                .drain(&mut file, &mut buf, out, cancel)
                                .await
                                .unwrap_or(ExitReason::Removed);
                        }
                        FileCheck::Truncated => {
                            info!(
                                path = ?self.target.path,
                                offset = self.target.offset,
                                "File truncated below read offset"
                            );
                            return ExitReason::Truncated;
                        }
                        FileCheck::Dead => {
                            info!(path = ?self.target.path, "Releasing inactive file");
                            return ExitReason::Dead;
                        }
                    }
                }
                ReaderState::Opening | ReaderState::Closed => return ExitReason::Stopped,
            }
        }
    }

    /// Open and position the handle. `Ok(None)` when the path already leads
    /// to a different file than the one we were asked to tail.
    async fn open(&mut self) -> io::Result<Option<File>> {
        let mut file = File::open(&self.target.path).await?;
        let metadata = file.metadata().await?;
        if self.identity.key_for(&self.target.path, &metadata) != self.target.file_key {
            return Ok(None);
        }

        if self.target.offset > metadata.len() {
            self.target.offset = 0;
        }
        file.seek(SeekFrom::Start(self.target.offset)).await?;

        debug!(
            path = ?self.target.path,
            offset = self.target.offset,
            "Opened file for tailing"
        );
        Ok(Some(file))
    }

    async fn emit(
        &mut self,
        bytes: &[u8],
        out: &BoundedSender<ReadEvent>,
        cancel: &CancellationToken,
    ) -> Emit {
        let end_offset = self.target.offset + bytes.len() as u64;
        let chunk = Chunk {
            bytes: bytes.to_vec(),
            end_offset,
        };

        tokio::select! {
            biased;
            res = out.send(ReadEvent::Data(chunk)) => match res {
                Ok(()) => {
                    self.target.offset = end_offset;
                    Emit::Sent
                }
                Err(_) => Emit::Disconnected,
            },
            _ = cancel.cancelled() => Emit::Cancelled,
        }
    }

    /// Forward whatever is readable right now, bounded by [`DRAIN_MAX_READS`].
    /// Returns an exit reason only if draining itself failed.
    async fn drain(
        &mut self,
        file: &mut File,
        buf: &mut [u8],
        out: &BoundedSender<ReadEvent>,
        cancel: &CancellationToken,
    ) -> Option<ExitReason> {
        for _ in 0..DRAIN_MAX_READS {
            match file.read(buf).await {
                Ok(0) => return None,
                Ok(n) => match self.emit(&buf[..n], out, cancel).await {
                    Emit::Sent => {}
                    Emit::Disconnected => return Some(ExitReason::Disconnected),
                    // already stopping; what was not sent is re-read from the checkpoint
                    Emit::Cancelled => return None,
                },
                Err(e) => {
                    warn!(path = ?self.target.path, error = %e, "Failed to drain file");
                    return Some(ExitReason::ReadError);
                }
            }
        }
        None
    }

    async fn inspect(&self) -> FileCheck {
        let metadata = match tokio::fs::metadata(&self.target.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return FileCheck::Removed,
            Err(e) => {
                debug!(path = ?self.target.path, error = %e, "Unable to stat tailed file");
                return FileCheck::Unchanged;
            }
        };

        if self.identity.key_for(&self.target.path, &metadata) != self.target.file_key {
            return FileCheck::Rotated;
        }
        if metadata.len() < self.target.offset {
            return FileCheck::Truncated;
        }
        if metadata.len() > self.target.offset {
            return FileCheck::Grown;
        }

        if let Some(dead_after) = self.settings.ignore_dead_log {
            let idle = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if idle > dead_after {
                return FileCheck::Dead;
            }
        }

        FileCheck::Unchanged
    }
}
