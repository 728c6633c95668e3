// SPDX-License-Identifier: Apache-2.0

//! Log file tailing with multiline reassembly.
//!
//! The [`Tailer`] discovers files matching include globs, follows each one
//! through appends, rotation, truncation and deletion, folds continuation
//! lines into multiline records and forwards normalized [`Record`]s to a
//! [`Sink`]. Read offsets are checkpointed in a [`CheckpointStore`] so a
//! restart resumes where the previous run stopped.

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod file_id;
pub mod finder;
pub mod multiline;
pub mod pipeline;
pub mod processor;
pub mod reader;
pub mod sink;
pub mod splitter;
pub mod textparser;
pub mod watcher;

pub use checkpoint::CheckpointStore;
pub use config::{ProcessorType, TailerConfig};
pub use coordinator::Tailer;
pub use decoder::{Charset, Decoder};
pub use dispatcher::{DropReason, Outcome, SourceMeta};
pub use error::{Error, Result};
pub use file_id::{FileIdentity, platform_identity};
pub use finder::{FileMatcher, resolve};
pub use multiline::Multiline;
pub use processor::{Fields, JsonProcessor, Processor, RegexProcessor};
pub use reader::{ExitReason, SingleFileReader, TailTarget};
pub use sink::{ChannelSink, Record, Sink, StdoutSink};
pub use splitter::{LineSplitter, RawLine};
pub use textparser::{LineAssembler, TextMode};
pub use watcher::{WatchMode, WatcherConfig};
