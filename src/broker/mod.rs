//! Topic broker: publish, subscribe, fan-out, consume.
//!
//! This module contains:
//! - `Topic` trait: the four public operations of a topic
//! - `Broker`: the implementation over a `StateStore`
//! - `engine`: the broadcast engine moving messages to delivery queues
//! - `registry`: subscriber set and delivery queue naming
//! - `trigger`: single-flight scheduling of broadcast cycles
//! - `consumer`: peek/dequeue with self-registration
//!
//! Message flow:
//! ```text
//! publish -> inputQueue -> BroadcastEngine -> queue_{id} (one per subscriber) -> peek/dequeue
//! ```
//!
//! Every transaction the broker opens locks collections in the same order:
//! ingestion queue, registry, delivery queues.

pub mod consumer;
pub mod engine;
pub mod registry;
pub mod trigger;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{BroadcastConfig, ConsumptionConfig};
use crate::model::{Message, SubscriberId, SubscriberIdError};
use crate::storage::{ReliableMap, ReliableQueue, StateStore, StorageError};
use crate::utils::retry::{retry_transient, RetryConfig, Transient};

pub use consumer::{Consumption, QueueOp};
pub use engine::{BroadcastEngine, CycleOutcome, CycleReport};
pub use registry::{delivery_queue, delivery_queue_name, SubscriberRegistry};
pub use trigger::{BroadcastTaskHandle, BroadcastTrigger};

/// Shared queue every publish appends to.
pub const INGESTION_QUEUE: &str = "inputQueue";
/// Registry map of subscriber id → `true`.
pub const REGISTRY_MAP: &str = "queueList";

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid subscriber id: {0}")]
    InvalidSubscriberId(#[from] SubscriberIdError),

    #[error("Unknown subscriber: {0}")]
    UnknownSubscriber(String),
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        match self {
            BrokerError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Public operations of a topic.
#[async_trait]
pub trait Topic: Send + Sync {
    /// Append a message to the ingestion queue. Returns once durable.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Register a subscriber. Registering twice is a no-op.
    ///
    /// Only messages published after registration are delivered.
    async fn register_subscriber(&self, id: &str) -> Result<()>;

    /// Head of the subscriber's delivery queue, left in place.
    async fn peek(&self, id: &str) -> Result<Option<Message>>;

    /// Remove and return the head of the subscriber's delivery queue.
    async fn dequeue(&self, id: &str) -> Result<Option<Message>>;
}

/// Broker for one topic.
pub struct Broker {
    store: Arc<dyn StateStore>,
    ingestion: ReliableQueue<Message>,
    registry: SubscriberRegistry,
    engine: Arc<BroadcastEngine>,
    consumption: Consumption,
    trigger: BroadcastTrigger,
    retry: RetryConfig,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

impl Broker {
    /// Attach to the topic's collections in `store`, creating them if needed.
    pub async fn open(
        store: Arc<dyn StateStore>,
        broadcast: &BroadcastConfig,
        consumption: &ConsumptionConfig,
    ) -> Result<Self> {
        let ingestion = ReliableQueue::<Message>::open(store.as_ref(), INGESTION_QUEUE).await?;
        let registry =
            SubscriberRegistry::new(ReliableMap::<bool>::open(store.as_ref(), REGISTRY_MAP).await?);

        let engine = Arc::new(BroadcastEngine::new(
            Arc::clone(&store),
            ingestion.clone(),
            registry.clone(),
            broadcast,
        ));
        let consumption = Consumption::new(Arc::clone(&store), registry.clone(), consumption);

        Ok(Self {
            store,
            ingestion,
            registry,
            engine,
            consumption,
            trigger: BroadcastTrigger::new(),
            retry: broadcast.retry.clone(),
        })
    }

    /// Start the background broadcast worker.
    ///
    /// The worker runs a cycle on every publish, registration and store
    /// change, plus once at start to drain messages left by a previous run.
    pub fn start(&self) -> BroadcastTaskHandle {
        info!("Starting broadcast worker");
        trigger::spawn_broadcast_tasks(
            Arc::clone(&self.engine),
            self.trigger.clone(),
            self.store.changes(),
        )
    }

    /// Run one broadcast cycle on the caller's task.
    pub async fn run_cycle(&self) -> CycleReport {
        let (_cancel, idle) = watch::channel(false);
        self.engine.run_cycle(&idle).await
    }

    /// Registered subscriber ids, sorted.
    pub async fn subscribers(&self) -> Result<Vec<String>> {
        retry_transient("broker.subscribers", self.retry.backoff(), move || async move {
            let mut tx = self.store.begin().await?;
            let ids = self.registry.list(tx.as_mut()).await?;
            tx.commit().await?;
            Ok::<_, BrokerError>(ids)
        })
        .await
    }

    /// Messages waiting in a subscriber's delivery queue.
    pub async fn pending(&self, id: &str) -> Result<u64> {
        let id = &SubscriberId::new(id)?;
        retry_transient("broker.pending", self.retry.backoff(), move || {
            self.consumption.pending(id)
        })
        .await
    }

    /// Messages not yet fanned out.
    pub async fn backlog(&self) -> Result<u64> {
        retry_transient("broker.backlog", self.retry.backoff(), move || async move {
            let mut tx = self.store.begin().await?;
            let count = self.ingestion.count(tx.as_mut()).await?;
            tx.commit().await?;
            Ok::<_, BrokerError>(count)
        })
        .await
    }

    /// Close the underlying store. Every later operation on this broker, or
    /// on any clone of its handle, fails with `StorageError::Closed`.
    pub async fn close(&self) {
        self.store.close().await;
    }

    async fn take(&self, id: &str, op: QueueOp) -> Result<Option<Message>> {
        let id = &SubscriberId::new(id)?;
        retry_transient("broker.consume", self.retry.backoff(), move || {
            self.consumption.take(id, op)
        })
        .await
    }
}

#[async_trait]
impl Topic for Broker {
    #[tracing::instrument(name = "broker.publish", skip_all, fields(message_id = %message.id))]
    async fn publish(&self, message: Message) -> Result<()> {
        let message = &message;
        retry_transient("broker.publish", self.retry.backoff(), move || async move {
            let mut tx = self.store.begin().await?;
            self.ingestion.enqueue(tx.as_mut(), message).await?;
            tx.commit().await?;
            Ok::<_, BrokerError>(())
        })
        .await?;

        debug!("Message published");
        self.trigger.fire();
        Ok(())
    }

    #[tracing::instrument(name = "broker.register", skip_all, fields(subscriber = %id))]
    async fn register_subscriber(&self, id: &str) -> Result<()> {
        let id = &SubscriberId::new(id)?;

        let added = retry_transient("broker.register", self.retry.backoff(), move || async move {
            let mut tx = self.store.begin().await?;
            let added = self.registry.register(tx.as_mut(), id).await?;
            tx.commit().await?;
            Ok::<_, BrokerError>(added)
        })
        .await?;

        if added {
            info!("Subscriber registered");
            self.trigger.fire();
        }
        Ok(())
    }

    #[tracing::instrument(name = "broker.peek", skip_all, fields(subscriber = %id))]
    async fn peek(&self, id: &str) -> Result<Option<Message>> {
        self.take(id, QueueOp::Peek).await
    }

    #[tracing::instrument(name = "broker.dequeue", skip_all, fields(subscriber = %id))]
    async fn dequeue(&self, id: &str) -> Result<Option<Message>> {
        self.take(id, QueueOp::Dequeue).await
    }
}
