//! In-process topic catalog.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::{AdminError, Result};
use crate::broker::{BroadcastTaskHandle, Broker};
use crate::config::{BroadcastConfig, ConsumptionConfig, StorageConfig, StorageType};
use crate::storage::{self, StateStore};

/// Provides the state store behind each topic.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    /// Open (creating if needed) the store of `topic`.
    async fn create(&self, topic: &str) -> Result<Arc<dyn StateStore>>;

    /// Remove whatever `create` persisted for `topic`.
    async fn destroy(&self, topic: &str) -> Result<()>;
}

/// `StoreFactory` driven by storage configuration.
///
/// Every topic gets its own database file under `storage.sqlite.directory`.
pub struct ConfigStoreFactory {
    storage: StorageConfig,
}

impl ConfigStoreFactory {
    /// Fails if SQLite is pinned to one file with `storage.sqlite.path`,
    /// which would put every topic into the same database.
    pub fn new(storage: StorageConfig) -> Result<Self> {
        if storage.storage_type == StorageType::Sqlite {
            if let Some(path) = &storage.sqlite.path {
                return Err(AdminError::SharedDatabasePath(path.clone()));
            }
        }
        Ok(Self { storage })
    }
}

#[async_trait]
impl StoreFactory for ConfigStoreFactory {
    async fn create(&self, topic: &str) -> Result<Arc<dyn StateStore>> {
        storage::init_store(&self.storage, topic)
            .await
            .map_err(|e| AdminError::Backend(e.to_string()))
    }

    async fn destroy(&self, topic: &str) -> Result<()> {
        storage::destroy_store(&self.storage, topic)
            .await
            .map_err(|e| AdminError::Storage(e.into()))
    }
}

struct HostedTopic {
    broker: Arc<Broker>,
    task: BroadcastTaskHandle,
}

/// Topics hosted by this process, each with its own broadcast worker.
pub struct TopicCatalog {
    factory: Arc<dyn StoreFactory>,
    broadcast: BroadcastConfig,
    consumption: ConsumptionConfig,
    topics: RwLock<HashMap<String, HostedTopic>>,
}

/// Topic names double as file names.
fn is_valid_topic_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl TopicCatalog {
    pub fn new(
        factory: Arc<dyn StoreFactory>,
        broadcast: BroadcastConfig,
        consumption: ConsumptionConfig,
    ) -> Self {
        Self {
            factory,
            broadcast,
            consumption,
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Create a topic and start its broadcast worker.
    pub async fn create_topic(&self, name: &str) -> Result<Arc<Broker>> {
        if !is_valid_topic_name(name) {
            return Err(AdminError::InvalidTopicName(name.to_string()));
        }

        let mut topics = self.topics.write().await;
        if topics.contains_key(name) {
            return Err(AdminError::TopicExists(name.to_string()));
        }

        let store = self.factory.create(name).await?;
        let broker = Arc::new(Broker::open(store, &self.broadcast, &self.consumption).await?);
        let task = broker.start();

        topics.insert(
            name.to_string(),
            HostedTopic {
                broker: Arc::clone(&broker),
                task,
            },
        );
        info!(topic = %name, "Topic created");
        Ok(broker)
    }

    /// Stop a topic's worker, close its store and remove its state.
    ///
    /// Brokers handed out earlier stay valid as values but fail every
    /// operation with `StorageError::Closed`.
    pub async fn delete_topic(&self, name: &str) -> Result<()> {
        let hosted = self
            .topics
            .write()
            .await
            .remove(name)
            .ok_or_else(|| AdminError::TopicNotFound(name.to_string()))?;

        hosted.task.shutdown().await;
        hosted.broker.close().await;
        self.factory.destroy(name).await?;

        info!(topic = %name, "Topic deleted");
        Ok(())
    }

    pub async fn topic(&self, name: &str) -> Option<Arc<Broker>> {
        self.topics
            .read()
            .await
            .get(name)
            .map(|hosted| Arc::clone(&hosted.broker))
    }

    /// Names of hosted topics, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every broadcast worker. State is kept.
    pub async fn shutdown(&self) {
        let hosted: Vec<(String, HostedTopic)> = self.topics.write().await.drain().collect();
        for (name, topic) in hosted {
            topic.task.shutdown().await;
            info!(topic = %name, "Topic stopped");
        }
    }
}
