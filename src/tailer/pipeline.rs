// SPDX-License-Identifier: Apache-2.0

//! Per-file processing: one reader task feeding one forwarder through a
//! bounded channel.
//!
//! The forwarder splits raw chunks into lines, decodes them, folds them into
//! multiline records, dispatches finished records and publishes checkpoints.
//! A checkpoint never moves past bytes that belong to a record which has not
//! been dispatched yet, so a restart re-reads exactly what was in flight.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bounded_channel::{BoundedReceiver, bounded};
use crate::tailer::checkpoint::CheckpointStore;
use crate::tailer::config::TailerConfig;
use crate::tailer::decoder::Decoder;
use crate::tailer::dispatcher::{DispatchSettings, Dispatcher, SourceMeta};
use crate::tailer::error::{Error, Result};
use crate::tailer::file_id::FileIdentity;
use crate::tailer::multiline::Multiline;
use crate::tailer::reader::{
    Chunk, ExitReason, ReadEvent, ReaderSettings, SingleFileReader, TailTarget,
};
use crate::tailer::splitter::{LineSplitter, RawLine};
use crate::tailer::textparser::{LineAssembler, TextMode};

const ANSI_ESCAPE_PATTERN: &str = r"[\x1b\x9b][\[\]()#;?]*(?:(?:(?:[a-zA-Z\d]*(?:;[a-zA-Z\d]*)*)?\x07)|(?:(?:\d{1,4}(?:;\d{0,4})*)?[\dA-PRZcf-ntqry=><~]))";

/// Everything the per-file tasks share.
pub struct PipelineContext {
    pub config: TailerConfig,
    pub dispatch: Arc<DispatchSettings>,
    pub store: Arc<CheckpointStore>,
    pub identity: Arc<dyn FileIdentity>,
}

impl PipelineContext {
    fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            wait_interval: self.config.wait_interval,
            ignore_dead_log: self.config.ignore_dead_log,
        }
    }
}

/// Tail one file until it ends or `cancel` fires.
///
/// Runs the reader on the current task and the forwarder on its own task,
/// waits for the forwarder to publish its final checkpoint, then adjusts the
/// stored checkpoint for how the file ended.
pub async fn tail_file(
    target: TailTarget,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
) -> Result<ExitReason> {
    let forwarder = Forwarder::new(&target, &ctx)?;
    let (tx, rx) = bounded(ctx.config.reader_buffer);

    let file_key = target.file_key.clone();
    let reader = SingleFileReader::new(target, ctx.identity.clone(), ctx.reader_settings());
    let forwarder = tokio::spawn(forwarder.run(rx));

    let reason = reader.run(tx, cancel).await;
    if let Err(e) = forwarder.await {
        error!(file_key = %file_key, error = %e, "Forwarder task failed");
    }

    match reason {
        ExitReason::Truncated => ctx.store.reset(&file_key),
        // the key can only come back through inode reuse
        ExitReason::Rotated | ExitReason::Removed => ctx.store.remove(&file_key),
        _ => {}
    }
    Ok(reason)
}

/// Consumer half of a file's pipeline.
pub struct Forwarder {
    path: PathBuf,
    file_key: String,
    inode: Option<u64>,
    decoder: Decoder,
    splitter: LineSplitter,
    mode: TextMode,
    assembler: LineAssembler,
    multiline: Multiline,
    ansi: Option<Regex>,
    dispatcher: Dispatcher,
    store: Arc<CheckpointStore>,
    /// File offset right after the last line taken from the splitter.
    cursor: u64,
}

impl Forwarder {
    pub fn new(target: &TailTarget, ctx: &PipelineContext) -> Result<Self> {
        let config = &ctx.config;
        let decoder = Decoder::new(&config.character_encoding)?;
        let splitter = LineSplitter::new(decoder.charset(), config.max_line_size);

        let ansi = if config.remove_ansi_escape_codes {
            Some(
                Regex::new(ANSI_ESCAPE_PATTERN)
                    .map_err(|e| Error::Regex(format!("invalid escape pattern: {}", e)))?,
            )
        } else {
            None
        };

        Ok(Self {
            path: target.path.clone(),
            file_key: target.file_key.clone(),
            inode: target.inode,
            decoder,
            splitter,
            mode: config.text_mode,
            assembler: LineAssembler::new(config.text_mode, config.max_line_size),
            multiline: config.multiline()?,
            ansi,
            dispatcher: Dispatcher::new(ctx.dispatch.clone(), &target.path),
            store: ctx.store.clone(),
            cursor: target.offset,
        })
    }

    /// Process events until the reader ends. Returns the reader's exit
    /// reason, or `None` if the reader went away without one.
    pub async fn run(mut self, mut events: BoundedReceiver<ReadEvent>) -> Option<ExitReason> {
        loop {
            let event = match self.multiline.deadline() {
                Some(deadline) => tokio::select! {
                    event = events.next() => event,
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        if let Some(text) = self.multiline.take_expired(Instant::now()) {
                            self.emit(text).await;
                            self.checkpoint();
                        }
                        continue;
                    }
                },
                None => events.next().await,
            };

            match event {
                Some(ReadEvent::Data(chunk)) => self.handle_chunk(chunk).await,
                Some(ReadEvent::End(reason)) => {
                    self.close(Some(reason)).await;
                    return Some(reason);
                }
                None => {
                    self.close(None).await;
                    return None;
                }
            }
        }
    }

    /// Offset below which every byte has been dispatched.
    pub fn committed_offset(&self) -> u64 {
        let held = self.multiline.pending_raw_len() + self.assembler.pending_raw_len();
        self.cursor.saturating_sub(held as u64)
    }

    async fn handle_chunk(&mut self, chunk: Chunk) {
        let now = Instant::now();
        for line in self.splitter.split(&chunk.bytes) {
            self.handle_line(line, now).await;
        }

        self.cursor = chunk
            .end_offset
            .saturating_sub(self.splitter.pending_len() as u64);
        self.checkpoint();
    }

    async fn handle_line(&mut self, line: RawLine, now: Instant) {
        if let Some(text) = self.multiline.take_expired(now) {
            self.emit(text).await;
        }

        self.cursor += line.consumed as u64;

        let consumed = line.consumed;
        match self.assembler.push(line) {
            Ok(Some(line)) => self.handle_whole_line(line, now).await,
            Ok(None) => {}
            Err(e) => {
                warn!(path = ?self.path, mode = %self.mode, error = %e, "Skipping unparseable line");
                self.skip(consumed);
            }
        }
    }

    /// Decode a complete log line and feed it to the multiline stage.
    async fn handle_whole_line(&mut self, line: RawLine, now: Instant) {
        let mut text = self.decoder.decode(&line.bytes);
        if let Some(ansi) = &self.ansi {
            if ansi.is_match(&text) {
                text = ansi.replace_all(&text, "").into_owned();
            }
        }
        text.truncate(text.trim_end().len());

        if text.is_empty() {
            self.skip(line.consumed);
            return;
        }

        if let Some(record) = self.multiline.process_at(&text, line.consumed, now) {
            self.emit(record).await;
        }
    }

    /// Bytes that produce no text still belong to whatever record is open.
    fn skip(&mut self, raw_len: usize) {
        if !self.assembler.absorb(raw_len) {
            self.multiline.skip(raw_len);
        }
    }

    async fn emit(&mut self, text: String) {
        if text.is_empty() {
            return;
        }

        let meta = SourceMeta {
            offset: self.cursor,
            inode: self.inode,
        };
        if let Err(e) = self.dispatcher.forward(&text, &meta).await {
            warn!(path = ?self.path, error = %e, "Dropping record");
        }
    }

    fn checkpoint(&self) {
        self.store.put(&self.file_key, self.committed_offset());
    }

    async fn close(&mut self, reason: Option<ExitReason>) {
        if reason.is_some_and(ExitReason::partial_line_final) {
            if let Some(line) = self.splitter.finish() {
                self.handle_line(line, Instant::now()).await;
            }
            if let Some(line) = self.assembler.finish() {
                self.handle_whole_line(line, Instant::now()).await;
            }
        }
        if let Some(text) = self.multiline.flush() {
            self.emit(text).await;
        }
        self.checkpoint();

        debug!(
            path = ?self.path,
            offset = self.committed_offset(),
            lines = self.dispatcher.read_lines(),
            ?reason,
            "Forwarder closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::BoundedSender;
    use crate::tailer::file_id::platform_identity;
    use crate::tailer::sink::test_support::MockSink;
    use portable_atomic::AtomicBool;
    use std::time::Duration;

    const KEY: &str = "/var/log/app.log::1";

    fn context(configure: impl FnOnce(&mut TailerConfig)) -> (Arc<PipelineContext>, Arc<MockSink>) {
        let mut config = TailerConfig {
            include: vec!["/var/log/*.log".to_string()],
            ..Default::default()
        };
        configure(&mut config);

        let sink = Arc::new(MockSink::default());
        let dispatch = DispatchSettings::from_config(
            &config,
            None,
            sink.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        let ctx = PipelineContext {
            config,
            dispatch: Arc::new(dispatch),
            store: Arc::new(CheckpointStore::open_memory()),
            identity: platform_identity(),
        };
        (Arc::new(ctx), sink)
    }

    fn target(offset: u64) -> TailTarget {
        TailTarget {
            path: PathBuf::from("/var/log/app.log"),
            file_key: KEY.to_string(),
            offset,
            from_beginning: false,
            inode: Some(1),
        }
    }

    fn spawn_forwarder(
        ctx: &PipelineContext,
        offset: u64,
    ) -> (
        BoundedSender<ReadEvent>,
        tokio::task::JoinHandle<Option<ExitReason>>,
    ) {
        let forwarder = Forwarder::new(&target(offset), ctx).unwrap();
        let (tx, rx) = bounded(16);
        (tx, tokio::spawn(forwarder.run(rx)))
    }

    async fn send_chunk(tx: &BoundedSender<ReadEvent>, bytes: &[u8], end_offset: u64) {
        tx.send(ReadEvent::Data(Chunk {
            bytes: bytes.to_vec(),
            end_offset,
        }))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_forwards_lines_and_checkpoints() {
        let (ctx, sink) = context(|_| {});
        let (tx, handle) = spawn_forwarder(&ctx, 100);

        send_chunk(&tx, b"one\r\ntwo\n\nthr", 113).await;
        send_chunk(&tx, b"ee\n", 116).await;
        tx.send(ReadEvent::End(ExitReason::Stopped)).await.unwrap();

        assert_eq!(handle.await.unwrap(), Some(ExitReason::Stopped));
        assert_eq!(sink.messages(), vec!["one", "two", "three"]);
        assert_eq!(ctx.store.get(KEY), Some(116));
    }

    #[tokio::test]
    async fn test_partial_line_not_checkpointed_on_stop() {
        let (ctx, sink) = context(|_| {});
        let (tx, handle) = spawn_forwarder(&ctx, 0);

        send_chunk(&tx, b"done\npart", 9).await;
        tx.send(ReadEvent::End(ExitReason::Stopped)).await.unwrap();
        handle.await.unwrap();

        assert_eq!(sink.messages(), vec!["done"]);
        assert_eq!(ctx.store.get(KEY), Some(5));
    }

    #[tokio::test]
    async fn test_partial_line_emitted_when_file_ends() {
        let (ctx, sink) = context(|_| {});
        let (tx, handle) = spawn_forwarder(&ctx, 0);

        send_chunk(&tx, b"done\nlast", 9).await;
        tx.send(ReadEvent::End(ExitReason::Removed)).await.unwrap();
        handle.await.unwrap();

        assert_eq!(sink.messages(), vec!["done", "last"]);
        assert_eq!(ctx.store.get(KEY), Some(9));
    }

    #[tokio::test]
    async fn test_multiline_holds_checkpoint() {
        let (ctx, sink) = context(|c| {
            c.multiline_match = vec![r"^\d{4}-\d{2}-\d{2}".to_string()];
            c.max_multiline_lifetime = Duration::from_secs(60);
        });
        let (tx, handle) = spawn_forwarder(&ctx, 0);

        // "2024-01-01 a\n" is 13 bytes, "  at x\n" 7, blank line 1
        send_chunk(&tx, b"2024-01-01 a\n  at x\n\n", 21).await;
        send_chunk(&tx, b"2024-01-02 b\n", 34).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.messages(), vec!["2024-01-01 a\n  at x"]);
        assert_eq!(ctx.store.get(KEY), Some(21));

        tx.send(ReadEvent::End(ExitReason::Stopped)).await.unwrap();
        handle.await.unwrap();
        assert_eq!(sink.messages().len(), 2);
        assert_eq!(ctx.store.get(KEY), Some(34));
    }

    #[tokio::test]
    async fn test_multiline_lifetime_timer_flushes() {
        let (ctx, sink) = context(|c| {
            c.multiline_match = vec![r"^\d{4}-\d{2}-\d{2}".to_string()];
            c.max_multiline_lifetime = Duration::from_millis(50);
        });
        let (tx, handle) = spawn_forwarder(&ctx, 0);

        send_chunk(&tx, b"2024-01-01 a\n  at x\n", 20).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(sink.messages(), vec!["2024-01-01 a\n  at x"]);
        assert_eq!(ctx.store.get(KEY), Some(20));

        drop(tx);
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_removes_ansi_escape_codes() {
        let (ctx, sink) = context(|c| c.remove_ansi_escape_codes = true);
        let (tx, handle) = spawn_forwarder(&ctx, 0);

        let line = b"\x1b[31mERROR\x1b[0m disk full\n";
        send_chunk(&tx, line, line.len() as u64).await;
        tx.send(ReadEvent::End(ExitReason::Stopped)).await.unwrap();
        handle.await.unwrap();

        assert_eq!(sink.messages(), vec!["ERROR disk full"]);
    }

    #[tokio::test]
    async fn test_utf16_file() {
        let (ctx, sink) = context(|c| c.character_encoding = "utf-16le".to_string());
        let (tx, handle) = spawn_forwarder(&ctx, 0);

        let bytes: Vec<u8> = "héllo\nwörld\n"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        send_chunk(&tx, &bytes, bytes.len() as u64).await;
        tx.send(ReadEvent::End(ExitReason::Stopped)).await.unwrap();
        handle.await.unwrap();

        assert_eq!(sink.messages(), vec!["héllo", "wörld"]);
        assert_eq!(ctx.store.get(KEY), Some(bytes.len() as u64));
    }

    #[tokio::test]
    async fn test_tail_file_resets_checkpoint_on_truncation() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "0123456789\n").unwrap();

        let (ctx, sink) = context(|c| c.wait_interval = Duration::from_millis(20));
        let file_key = ctx.identity.identity(&path).unwrap();
        let target = TailTarget {
            path: path.clone(),
            file_key: file_key.clone(),
            offset: 0,
            from_beginning: true,
            inode: None,
        };

        let handle = tokio::spawn(tail_file(target, ctx.clone(), CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.store.get(&file_key), Some(11));

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(0)
            .unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, ExitReason::Truncated);
        assert_eq!(ctx.store.get(&file_key), Some(0));
        assert_eq!(sink.messages(), vec!["0123456789"]);
    }

    #[tokio::test]
    async fn test_docker_json_partial_lines_are_joined() {
        let (ctx, sink) = context(|c| c.text_mode = TextMode::DockerJson);
        let (tx, handle) = spawn_forwarder(&ctx, 0);

        let first = b"{\"log\":\"hel\",\"stream\":\"stdout\"}\n";
        let second = b"{\"log\":\"lo\\n\",\"stream\":\"stdout\"}\n";
        let garbage = b"not json\n";
        let third = b"{\"log\":\"bye\\n\",\"stream\":\"stderr\"}\n";

        send_chunk(&tx, first, first.len() as u64).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        // the partial piece is not committed yet
        assert_eq!(ctx.store.get(KEY), Some(0));

        let mut rest = Vec::new();
        rest.extend_from_slice(second);
        rest.extend_from_slice(garbage);
        rest.extend_from_slice(third);
        let end = (first.len() + rest.len()) as u64;
        send_chunk(&tx, &rest, end).await;
        tx.send(ReadEvent::End(ExitReason::Stopped)).await.unwrap();
        handle.await.unwrap();

        assert_eq!(sink.messages(), vec!["hello", "bye"]);
        assert_eq!(ctx.store.get(KEY), Some(end));
    }

    #[tokio::test]
    async fn test_cri_partial_held_back_on_stop() {
        let (ctx, sink) = context(|c| c.text_mode = TextMode::CriLog);
        let (tx, handle) = spawn_forwarder(&ctx, 0);

        let full = b"2024-01-01T00:00:00Z stdout F one\n";
        let piece = b"2024-01-01T00:00:01Z stdout P tw\n";
        let mut bytes = full.to_vec();
        bytes.extend_from_slice(piece);

        send_chunk(&tx, &bytes, bytes.len() as u64).await;
        tx.send(ReadEvent::End(ExitReason::Stopped)).await.unwrap();
        handle.await.unwrap();

        assert_eq!(sink.messages(), vec!["one"]);
        assert_eq!(ctx.store.get(KEY), Some(full.len() as u64));
    }

    #[tokio::test]
    async fn test_cri_partial_released_when_file_ends() {
        let (ctx, sink) = context(|c| c.text_mode = TextMode::CriLog);
        let (tx, handle) = spawn_forwarder(&ctx, 0);

        let piece = b"2024-01-01T00:00:01Z stdout P tail\n";
        send_chunk(&tx, piece, piece.len() as u64).await;
        tx.send(ReadEvent::End(ExitReason::Removed)).await.unwrap();
        handle.await.unwrap();

        assert_eq!(sink.messages(), vec!["tail"]);
        assert_eq!(ctx.store.get(KEY), Some(piece.len() as u64));
    }
}
