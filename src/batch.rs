//! Sequential, resumable batch driver.
//!
//! Walks the work queue in order, one item at a time. Each item moves through
//! a small state machine:
//!
//! ```text
//! Pending ──(id in checkpoint)──────────────────────────────▶ Skipped
//!    │
//!    └──▶ InFlight ──(every image written)──▶ metrics ─▶ checkpoint ─▶ Completed
//!             │
//!             └──(source unreadable / transport error /
//!                 zero images / any image unwritable)───────▶ Failed
//! ```
//!
//! Failed items are not checkpointed, so the next run retries them; the batch
//! always continues with the next item. Re-running the whole pipeline is the
//! retry mechanism: completed and skipped items are skipped again.
//!
//! Within a completed item, outputs are written first, then one metrics row
//! per output is appended, then the id is recorded. If any image of an item
//! cannot be written, no metrics rows are appended for it and it is not
//! recorded; images already on disk are overwritten by the retry. A process killed before
//! the checkpoint append leaves the item unrecorded and it is redone next run.
//! Metrics and checkpoint write failures are reported loudly but never undo
//! outputs already on disk.

use crate::checkpoint::CheckpointStore;
use crate::client::{ClientError, GenerationClient};
use crate::metrics::{MetricsLog, MetricsRecord, ResourceSampler};
use crate::queue::WorkItem;
use crate::request::Params;
use crate::writer::{Output, OutputWriter, WriteError};
use std::fmt;
use std::sync::mpsc::Sender;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle of one work item within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    InFlight,
    Completed,
    Failed,
    Skipped,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether `next` is a legal step from `self`.
    pub fn can_advance_to(self, next: ItemState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Skipped | Self::InFlight)
                | (Self::InFlight, Self::Completed | Self::Failed)
        )
    }
}

/// Why an item ended up [`ItemState::Failed`].
#[derive(Error, Debug)]
pub enum ItemFailure {
    #[error("could not read source image: {0}")]
    Source(#[from] std::io::Error),
    #[error("generation failed: {0}")]
    Generation(#[from] ClientError),
    #[error("server returned no images")]
    NoImages,
    #[error("could not write image: {0}")]
    Write(#[from] WriteError),
}

/// Progress notifications, sent in queue order.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    /// An item left `Pending`. `position` is 1-based.
    Started {
        position: usize,
        total: usize,
        id: String,
    },
    Skipped {
        id: String,
    },
    Completed {
        id: String,
        outputs: Vec<Output>,
        elapsed: Duration,
    },
    Failed {
        id: String,
        reason: String,
    },
    /// A metrics or checkpoint write failed; outputs are kept.
    PersistenceError {
        id: String,
        reason: String,
    },
}

/// Final state of one item.
#[derive(Debug)]
pub struct ItemOutcome {
    pub id: String,
    pub state: ItemState,
    pub outputs: Vec<Output>,
    pub failure: Option<ItemFailure>,
}

/// Totals for a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub images_written: usize,
    pub unverified: usize,
    pub persistence_errors: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.completed + self.skipped + self.failed
    }

    /// Count an item that reached `state`. Non-terminal states are not counted.
    pub fn count(&mut self, state: ItemState) {
        match state {
            ItemState::Completed => self.completed += 1,
            ItemState::Skipped => self.skipped += 1,
            ItemState::Failed => self.failed += 1,
            ItemState::Pending | ItemState::InFlight => {}
        }
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} skipped, {} failed ({} total); {} images written",
            self.completed,
            self.skipped,
            self.failed,
            self.total(),
            self.images_written
        )?;
        if self.unverified > 0 {
            write!(f, ", {} unverified", self.unverified)?;
        }
        if self.persistence_errors > 0 {
            write!(f, ", {} log write errors", self.persistence_errors)?;
        }
        Ok(())
    }
}

/// Everything an item passes through, owned for the duration of a run.
pub struct BatchDriver<C, S> {
    client: C,
    sampler: S,
    base_params: Params,
    writer: OutputWriter,
    metrics: MetricsLog,
    checkpoint: CheckpointStore,
    events: Option<Sender<BatchEvent>>,
}

impl<C: GenerationClient, S: ResourceSampler> BatchDriver<C, S> {
    pub fn new(
        client: C,
        sampler: S,
        base_params: Params,
        writer: OutputWriter,
        metrics: MetricsLog,
        checkpoint: CheckpointStore,
    ) -> Self {
        Self {
            client,
            sampler,
            base_params,
            writer,
            metrics,
            checkpoint,
            events: None,
        }
    }

    /// Stream [`BatchEvent`]s to `tx` while running.
    pub fn with_events(mut self, tx: Sender<BatchEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Process every item of `queue` in order and return the totals.
    pub fn run(&mut self, queue: &[WorkItem]) -> BatchReport {
        let mut report = BatchReport::default();
        let total = queue.len();

        for (i, item) in queue.iter().enumerate() {
            self.emit(BatchEvent::Started {
                position: i + 1,
                total,
                id: item.id.clone(),
            });

            let outcome = self.process_item(item, &mut report);
            report.count(outcome.state);
            match outcome.state {
                ItemState::Skipped => {
                    self.emit(BatchEvent::Skipped {
                        id: outcome.id,
                    });
                }
                ItemState::Failed => {
                    let reason = outcome
                        .failure
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "unknown failure".to_string());
                    tracing::error!(item = %outcome.id, %reason, "item failed");
                    self.emit(BatchEvent::Failed {
                        id: outcome.id,
                        reason,
                    });
                }
                // Completed already emitted its event with the outputs
                _ => {}
            }
        }

        tracing::info!(%report, "batch finished");
        report
    }

    /// Drive one item to a terminal state.
    pub fn process_item(&mut self, item: &WorkItem, report: &mut BatchReport) -> ItemOutcome {
        let mut state = ItemState::Pending;
        if self.checkpoint.contains(&item.id) {
            tracing::debug!(item = %item.id, "already processed, skipping");
            advance(item, &mut state, ItemState::Skipped);
            return ItemOutcome {
                id: item.id.clone(),
                state,
                outputs: Vec::new(),
                failure: None,
            };
        }

        advance(item, &mut state, ItemState::InFlight);
        match self.generate_and_write(item, report) {
            Ok((outputs, elapsed)) => {
                if let Err(e) = self.checkpoint.record(&item.id) {
                    self.persistence_error(item, e.to_string(), report);
                }
                self.emit(BatchEvent::Completed {
                    id: item.id.clone(),
                    outputs: outputs.clone(),
                    elapsed,
                });
                advance(item, &mut state, ItemState::Completed);
                ItemOutcome {
                    id: item.id.clone(),
                    state,
                    outputs,
                    failure: None,
                }
            }
            Err(failure) => {
                advance(item, &mut state, ItemState::Failed);
                ItemOutcome {
                    id: item.id.clone(),
                    state,
                    outputs: Vec::new(),
                    failure: Some(failure),
                }
            }
        }
    }

    /// The `InFlight` part: request, write every image, log metrics.
    fn generate_and_write(
        &mut self,
        item: &WorkItem,
        report: &mut BatchReport,
    ) -> Result<(Vec<Output>, Duration), ItemFailure> {
        let request = item.request(&self.base_params)?;
        let sample = self.sampler.sample();

        tracing::info!(item = %item.id, "generating");
        let result = self.client.generate(&request);
        if let Some(error) = result.error {
            return Err(ItemFailure::Generation(error));
        }
        if result.images.is_empty() {
            return Err(ItemFailure::NoImages);
        }

        // All images must land before anything is logged for the item
        let mut outputs = Vec::with_capacity(result.images.len());
        for (i, bytes) in result.images.iter().enumerate() {
            let image_index = i + 1;
            let output = self.writer.write(item, image_index, bytes).inspect_err(|e| {
                tracing::error!(item = %item.id, image_index, error = %e, "could not write image");
            })?;
            tracing::info!(
                item = %item.id,
                path = %output.path.display(),
                verified = output.verified,
                "image saved"
            );
            outputs.push(output);
        }

        for output in &outputs {
            report.images_written += 1;
            if !output.verified {
                report.unverified += 1;
            }
            let record = MetricsRecord {
                item_id: item.id.clone(),
                filename: output.filename(),
                cpu_percent: sample.cpu_percent,
                ram_mb: sample.ram_mb,
                elapsed_secs: result.elapsed.as_secs_f64(),
            };
            if let Err(e) = self.metrics.append(&record) {
                self.persistence_error(item, e.to_string(), report);
            }
        }

        Ok((outputs, result.elapsed))
    }

    fn persistence_error(&self, item: &WorkItem, reason: String, report: &mut BatchReport) {
        report.persistence_errors += 1;
        tracing::error!(item = %item.id, %reason, "log write failed; outputs are kept");
        self.emit(BatchEvent::PersistenceError {
            id: item.id.clone(),
            reason,
        });
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.events {
            // A closed receiver only means nobody is printing
            let _ = tx.send(event);
        }
    }
}

fn advance(item: &WorkItem, state: &mut ItemState, next: ItemState) {
    debug_assert!(state.can_advance_to(next), "{state:?} -> {next:?}");
    tracing::trace!(item = %item.id, from = ?*state, to = ?next, "state change");
    *state = next;
}

/// Split `queue` into items that would run and items already checkpointed,
/// without touching the network.
pub fn plan<'a>(
    queue: &'a [WorkItem],
    checkpoint: &CheckpointStore,
) -> (Vec<&'a WorkItem>, Vec<&'a WorkItem>) {
    queue
        .iter()
        .partition(|item| !checkpoint.contains(&item.id))
}
