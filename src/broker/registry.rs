//! Subscriber registry and delivery queue naming.

use crate::model::{Message, SubscriberId};
use crate::storage::{ReliableMap, ReliableQueue, Result, Transaction};

/// Prefix of every per-subscriber delivery queue.
pub const DELIVERY_QUEUE_PREFIX: &str = "queue_";

/// Name of the delivery queue owned by `id`.
pub fn delivery_queue_name(id: &str) -> String {
    format!("{}{}", DELIVERY_QUEUE_PREFIX, id)
}

/// Handle to a subscriber's delivery queue.
///
/// Storage is materialised on the first transaction that touches it.
pub fn delivery_queue(id: &str) -> ReliableQueue<Message> {
    ReliableQueue::named(delivery_queue_name(id))
}

/// Set of registered subscribers, stored as id → `true`.
#[derive(Debug, Clone)]
pub struct SubscriberRegistry {
    map: ReliableMap<bool>,
}

impl SubscriberRegistry {
    pub fn new(map: ReliableMap<bool>) -> Self {
        Self { map }
    }

    /// Add `id` if absent. Returns whether it was added.
    ///
    /// Re-registering writes nothing, so the caller's commit stays silent.
    pub async fn register(&self, tx: &mut dyn Transaction, id: &SubscriberId) -> Result<bool> {
        self.map.try_add(tx, id.as_str(), &true).await
    }

    pub async fn contains(&self, tx: &mut dyn Transaction, id: &SubscriberId) -> Result<bool> {
        self.map.contains_key(tx, id.as_str()).await
    }

    /// Registered ids, sorted.
    pub async fn list(&self, tx: &mut dyn Transaction) -> Result<Vec<String>> {
        Ok(self
            .map
            .entries(tx)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }
}
