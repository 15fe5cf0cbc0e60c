//! Single-flight scheduling of broadcast cycles.
//!
//! Any number of signals collapse into at most one pending cycle: `Notify`
//! holds a single permit, and one worker task consumes it. Signals arriving
//! while a cycle runs leave the permit set, so exactly one more cycle
//! follows.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::{BroadcastEngine, CycleOutcome};
use crate::storage::StoreEvent;

/// Coalescing "run a cycle" signal.
#[derive(Debug, Clone, Default)]
pub struct BroadcastTrigger {
    notify: Arc<Notify>,
}

impl BroadcastTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a cycle. Never blocks.
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    /// Wait for, and consume, the pending request.
    pub async fn fired(&self) {
        self.notify.notified().await;
    }
}

/// Handle to the running broadcast tasks.
pub struct BroadcastTaskHandle {
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BroadcastTaskHandle {
    /// Signal the tasks to stop.
    ///
    /// A fan-out step in flight finishes; the cycle ends before the next one.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop and wait for the tasks to exit.
    pub async fn shutdown(self) {
        self.stop();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Broadcast task ended abnormally");
            }
        }
    }
}

/// Spawn the broadcast worker and the change-feed listener.
pub(crate) fn spawn_broadcast_tasks(
    engine: Arc<BroadcastEngine>,
    trigger: BroadcastTrigger,
    changes: broadcast::Receiver<StoreEvent>,
) -> BroadcastTaskHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let worker = tokio::spawn(run_worker(engine, trigger.clone(), cancel_rx.clone()));
    let listener = tokio::spawn(run_listener(trigger.clone(), changes, cancel_rx));

    // Drain anything left over from a previous run.
    trigger.fire();

    BroadcastTaskHandle {
        cancel: cancel_tx,
        tasks: vec![worker, listener],
    }
}

async fn run_worker(
    engine: Arc<BroadcastEngine>,
    trigger: BroadcastTrigger,
    mut cancel: watch::Receiver<bool>,
) {
    info!("Broadcast worker started");

    loop {
        tokio::select! {
            _ = trigger.fired() => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
                continue;
            }
        }

        let report = engine.run_cycle(&cancel).await;
        if report.outcome == CycleOutcome::Cancelled {
            break;
        }
    }

    info!("Broadcast worker stopped");
}

/// Turn every change notification into a trigger.
///
/// A lagged receiver has missed events, which is itself a reason to re-check.
async fn run_listener(
    trigger: BroadcastTrigger,
    mut changes: broadcast::Receiver<StoreEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = changes.recv() => match event {
                Ok(event) => {
                    debug!(?event, "State change observed");
                    trigger.fire();
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "Change feed lagged");
                    trigger.fire();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }
    }
}
