//! Placeholder tagging task: marks a record as processing, waits, then
//! attaches a fixed tag list.

use std::time::{Duration, Instant};

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ProcessingConfig;
use crate::process::ProcessStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Done,
    /// The record vanished before the task started.
    Missing,
    /// Shutdown was requested while the task was waiting.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Processor {
    delay: Duration,
    tags: Vec<String>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Completion signal of one spawned task. Dropping it detaches the task.
#[derive(Debug)]
pub struct ProcessingHandle {
    process_id: String,
    join: JoinHandle<ProcessOutcome>,
}

impl ProcessingHandle {
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<ProcessOutcome, JoinError> {
        self.join.await
    }
}

impl Processor {
    pub fn new(config: &ProcessingConfig, shutdown: CancellationToken) -> Self {
        Self {
            delay: config.delay(),
            tags: config.tags.clone(),
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn spawn(&self, store: ProcessStore, process_id: String) -> ProcessingHandle {
        let processor = self.clone();
        let task_id = process_id.clone();
        let join = self
            .tracker
            .spawn(async move { processor.run(&store, &task_id).await });

        ProcessingHandle { process_id, join }
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Stops accepting new tasks and waits for the running ones to return.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub async fn run(&self, store: &ProcessStore, process_id: &str) -> ProcessOutcome {
        if !store.mark_processing(process_id) {
            warn!(process_id, "Process record missing; skipping processing");
            return ProcessOutcome::Missing;
        }

        let started = Instant::now();
        debug!(process_id, delay_ms = self.delay.as_millis() as u64, "Processing started");

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = self.shutdown.cancelled() => {
                info!(process_id, "Processing interrupted by shutdown");
                return ProcessOutcome::Cancelled;
            }
        }

        if !store.mark_done(process_id, self.tags.clone()) {
            warn!(process_id, "Process record disappeared during processing");
            return ProcessOutcome::Missing;
        }

        info!(
            process_id,
            tag_count = self.tags.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Processing finished"
        );
        ProcessOutcome::Done
    }
}
