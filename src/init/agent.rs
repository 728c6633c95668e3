// SPDX-License-Identifier: Apache-2.0

use crate::init::args::TailerArgs;
use crate::init::wait::{self, TaskSet};
use crate::tailer::checkpoint::CheckpointStore;
use crate::tailer::coordinator::Tailer;
use crate::tailer::sink::{Sink, StdoutSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, info, warn};

// Extra time granted to the tailer task beyond its own shutdown grace.
const TAILER_EXIT_SLACK: Duration = Duration::from_secs(1);

/// Runs a tailer together with the checkpoint flusher until cancelled.
pub struct Agent {
    args: TailerArgs,
    sink: Option<Arc<dyn Sink>>,
}

impl Agent {
    pub fn new(args: TailerArgs) -> Self {
        Self { args, sink: None }
    }

    /// Forward records to `sink` instead of stdout.
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn run(self, agent_cancel: CancellationToken) -> Result<(), BoxError> {
        info!(include = ?self.args.include, "Starting logtail.");

        self.args.validate()?;
        let config = self.args.build_config();
        let store = Arc::new(CheckpointStore::open_or_recover(&self.args.offsets_path)?);
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(StdoutSink::new()) as Arc<dyn Sink>);
        let tailer = Tailer::new(config, store.clone(), sink)?;

        let flush_cancel = CancellationToken::new();
        let flusher = CheckpointStore::spawn_flusher(
            store.clone(),
            self.args.checkpoint_interval(),
            flush_cancel.clone(),
        );

        let tailer_cancel = CancellationToken::new();
        let mut tailer_task_set = TaskSet::new();
        {
            let token = tailer_cancel.clone();
            tailer_task_set.spawn(async move { tailer.run(token).await.map_err(BoxError::from) });
        }

        let mut result = Ok(());
        select! {
            _ = agent_cancel.cancelled() => {
                debug!("Agent cancellation signaled.");
            },
            e = wait::wait_for_any_task(&mut tailer_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of tailer."),
                    Err(e) => result = Err(e),
                }
            },
        }

        // Stop tailing first so the final offsets are in the store before it closes.
        tailer_cancel.cancel();
        let grace = self.args.shutdown_grace();
        if let Err(e) =
            wait::wait_for_tasks_with_timeout(&mut tailer_task_set, grace + TAILER_EXIT_SLACK).await
        {
            warn!(error = %e, "Tailer did not exit cleanly.");
        }

        flush_cancel.cancel();
        if let Err(e) = flusher.await {
            error!(error = %e, "Checkpoint flusher task failed.");
        }
        if let Err(e) = CheckpointStore::close(store, grace).await {
            error!(error = %e, "Failed to persist checkpoints on shutdown.");
        }

        info!("Logtail stopped.");
        result
    }
}
