//! Consumption protocol: peek, then dequeue once processed.
//!
//! A consumer peeks the head of its delivery queue, processes it, and only
//! then dequeues. A crash between the two leaves the message at the head,
//! so it is seen again.

use std::sync::Arc;

use tracing::info;

use super::registry::{delivery_queue, SubscriberRegistry};
use super::{BrokerError, Result};
use crate::config::ConsumptionConfig;
use crate::model::{Message, SubscriberId};
use crate::storage::{StateStore, Transaction};

/// Which end-of-queue operation a consumer performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    /// Read the head without removing it.
    Peek,
    /// Remove and return the head.
    Dequeue,
}

/// Per-subscriber access to delivery queues.
pub struct Consumption {
    store: Arc<dyn StateStore>,
    registry: SubscriberRegistry,
    auto_register: bool,
}

impl Consumption {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: SubscriberRegistry,
        config: &ConsumptionConfig,
    ) -> Self {
        Self {
            store,
            registry,
            auto_register: config.auto_register,
        }
    }

    /// Peek or dequeue the head of `id`'s delivery queue in one transaction.
    pub async fn take(&self, id: &SubscriberId, op: QueueOp) -> Result<Option<Message>> {
        let mut tx = self.store.begin().await?;
        self.admit(tx.as_mut(), id).await?;

        let queue = delivery_queue(id.as_str());
        let message = match op {
            QueueOp::Peek => queue.try_peek(tx.as_mut()).await?,
            QueueOp::Dequeue => queue.try_dequeue(tx.as_mut()).await?,
        };

        tx.commit().await?;
        Ok(message)
    }

    /// Number of messages waiting for `id`.
    ///
    /// Never registers; an unknown id has nothing pending.
    pub async fn pending(&self, id: &SubscriberId) -> Result<u64> {
        let mut tx = self.store.begin().await?;
        if !self.registry.contains(tx.as_mut(), id).await? {
            if self.auto_register {
                return Ok(0);
            }
            return Err(BrokerError::UnknownSubscriber(id.to_string()));
        }
        let count = delivery_queue(id.as_str()).count(tx.as_mut()).await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Make sure `id` is registered before its queue is touched.
    async fn admit(&self, tx: &mut dyn Transaction, id: &SubscriberId) -> Result<()> {
        if self.registry.contains(tx, id).await? {
            return Ok(());
        }
        if !self.auto_register {
            return Err(BrokerError::UnknownSubscriber(id.to_string()));
        }
        if self.registry.register(tx, id).await? {
            info!(subscriber = %id, "Subscriber registered on first access");
        }
        Ok(())
    }
}
