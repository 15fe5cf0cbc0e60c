//! Broadcast engine: moves messages from the ingestion queue to every
//! subscriber's delivery queue.
//!
//! Each fan-out step is one transaction: dequeue up to `batch_size` messages
//! from the head of the ingestion queue, read the registry, enqueue every
//! message onto every listed delivery queue, commit. If anything fails
//! before the commit lands, the step rolls back and the messages stay at the
//! head, so they are fanned out by a later step (at-least-once).

use std::sync::Arc;

use backon::ExponentialBuilder;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::registry::{delivery_queue, SubscriberRegistry};
use crate::config::BroadcastConfig;
use crate::model::Message;
use crate::storage::{ReliableQueue, StateStore, StorageError};
use crate::utils::retry::{retry_transient_until, RetryConfig, Transient};

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The ingestion queue was empty.
    Drained,
    /// Shutdown was requested between steps or while a step was backing off.
    Cancelled,
    /// A step kept hitting contention; its messages are still in the
    /// ingestion queue.
    GaveUp,
    /// A step failed with an error retrying cannot fix, such as a head
    /// message that does not decode. The message stays at the head.
    Failed,
}

/// Summary of one broadcast cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages removed from the ingestion queue.
    pub messages: usize,
    /// Copies written to delivery queues.
    pub deliveries: usize,
    pub outcome: CycleOutcome,
}

impl Default for CycleReport {
    fn default() -> Self {
        Self {
            messages: 0,
            deliveries: 0,
            outcome: CycleOutcome::Drained,
        }
    }
}

struct Step {
    messages: usize,
    deliveries: usize,
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("broadcast cancelled")]
    Cancelled,
}

impl Transient for StepError {
    fn is_transient(&self) -> bool {
        match self {
            StepError::Storage(e) => e.is_transient(),
            StepError::Cancelled => false,
        }
    }
}

/// Resolves once `cancel` turns true. A dropped sender never cancels.
async fn cancelled(mut cancel: watch::Receiver<bool>) -> StepError {
    loop {
        if *cancel.borrow_and_update() {
            return StepError::Cancelled;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Fan-out engine for one topic.
pub struct BroadcastEngine {
    store: Arc<dyn StateStore>,
    ingestion: ReliableQueue<Message>,
    registry: SubscriberRegistry,
    batch_size: usize,
    retry: RetryConfig,
    /// Held for the duration of a cycle.
    running: Mutex<()>,
}

impl BroadcastEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        ingestion: ReliableQueue<Message>,
        registry: SubscriberRegistry,
        config: &BroadcastConfig,
    ) -> Self {
        Self {
            store,
            ingestion,
            registry,
            batch_size: config.batch_size.max(1),
            retry: config.retry.clone(),
            running: Mutex::new(()),
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        self.retry.backoff()
    }

    /// Fan out until the ingestion queue is empty, `cancel` turns true, or a
    /// step fails. `cancel` is also honoured while a step backs off.
    ///
    /// Cycles never overlap; a caller arriving mid-cycle waits for it.
    pub async fn run_cycle(&self, cancel: &watch::Receiver<bool>) -> CycleReport {
        let _running = self.running.lock().await;
        let mut report = CycleReport::default();

        loop {
            if *cancel.borrow() {
                info!(
                    messages = report.messages,
                    "Broadcast cycle cancelled, remaining messages left in ingestion queue"
                );
                report.outcome = CycleOutcome::Cancelled;
                break;
            }

            let step = retry_transient_until(
                "broadcast.step",
                self.backoff(),
                cancelled(cancel.clone()),
                || self.step(),
            )
            .await;

            match step {
                Ok(Some(step)) => {
                    report.messages += step.messages;
                    report.deliveries += step.deliveries;
                }
                Ok(None) => break,
                Err(StepError::Cancelled) => {
                    info!(
                        messages = report.messages,
                        "Broadcast cycle cancelled during backoff, head message left in ingestion queue"
                    );
                    report.outcome = CycleOutcome::Cancelled;
                    break;
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Broadcast step gave up, will resume on next trigger");
                    report.outcome = CycleOutcome::GaveUp;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Broadcast step failed, head message left in ingestion queue");
                    report.outcome = CycleOutcome::Failed;
                    break;
                }
            }
        }

        if report.messages > 0 {
            debug!(
                messages = report.messages,
                deliveries = report.deliveries,
                outcome = ?report.outcome,
                "Broadcast cycle finished"
            );
        }
        report
    }

    /// One fan-out transaction. `None` when there was nothing to move.
    async fn step(&self) -> Result<Option<Step>, StepError> {
        let mut tx = self.store.begin().await?;

        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.ingestion.try_dequeue(tx.as_mut()).await? {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        if batch.is_empty() {
            return Ok(None);
        }

        let subscribers = self.registry.list(tx.as_mut()).await?;
        for id in &subscribers {
            let queue = delivery_queue(id);
            for message in &batch {
                queue.enqueue(tx.as_mut(), message).await?;
            }
        }

        tx.commit().await?;

        debug!(
            messages = batch.len(),
            subscribers = subscribers.len(),
            "Fan-out committed"
        );
        Ok(Some(Step {
            messages: batch.len(),
            deliveries: batch.len() * subscribers.len(),
        }))
    }
}
