//! Topic administration.
//!
//! This module contains:
//! - `TopicAdmin`: the two opaque access keys of a service
//! - `TopicCatalog`: in-process creation and deletion of topics
//!
//! Keys are stored, not enforced: the broker never checks them.

mod catalog;

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use tracing::info;

use crate::broker::BrokerError;
use crate::storage::{ReliableMap, StateStore, StorageError};
use crate::utils::retry::{retry_transient, RetryConfig, Transient};

pub use catalog::{ConfigStoreFactory, StoreFactory, TopicCatalog};

/// Map holding the access keys.
pub const KEYS_MAP: &str = "keys";

/// Random bytes per generated key.
const KEY_BYTES: usize = 32;

/// Result type for admin operations.
pub type Result<T> = std::result::Result<T, AdminError>;

/// Errors that can occur during admin operations.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("No key initialized in slot {slot}")]
    KeyNotInitialized { slot: KeySlot },

    #[error("Topic already exists: {0}")]
    TopicExists(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Invalid topic name '{0}'")]
    InvalidTopicName(String),

    #[error("State store backend failed: {0}")]
    Backend(String),

    #[error("storage.sqlite.path '{0}' names a single file; a catalog needs storage.sqlite.directory")]
    SharedDatabasePath(String),
}

impl Transient for AdminError {
    fn is_transient(&self) -> bool {
        match self {
            AdminError::Storage(e) => e.is_transient(),
            AdminError::Broker(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// One of the two key slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySlot {
    Primary,
    Secondary,
}

impl KeySlot {
    pub const ALL: [KeySlot; 2] = [KeySlot::Primary, KeySlot::Secondary];

    /// Storage key of the slot.
    pub fn key_name(&self) -> &'static str {
        match self {
            KeySlot::Primary => "key1",
            KeySlot::Secondary => "key2",
        }
    }
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_name())
    }
}

fn generate_key() -> String {
    let bytes: [u8; KEY_BYTES] = rand::rng().random();
    hex::encode(bytes)
}

/// Access keys of a service.
pub struct TopicAdmin {
    store: Arc<dyn StateStore>,
    keys: ReliableMap<String>,
    retry: RetryConfig,
}

impl TopicAdmin {
    pub async fn open(store: Arc<dyn StateStore>, retry: &RetryConfig) -> Result<Self> {
        let keys = ReliableMap::<String>::open(store.as_ref(), KEYS_MAP).await?;
        Ok(Self {
            store,
            keys,
            retry: retry.clone(),
        })
    }

    /// Generate any key that is missing or blank. Existing keys are kept.
    ///
    /// Safe to call on every start.
    pub async fn activate(&self) -> Result<()> {
        let generated = retry_transient("admin.activate", self.retry.backoff(), move || async move {
            let mut tx = self.store.begin().await?;
            let mut generated = Vec::new();
            for slot in KeySlot::ALL {
                let current = self.keys.try_get(tx.as_mut(), slot.key_name()).await?;
                if current.map_or(true, |key| key.trim().is_empty()) {
                    self.keys
                        .set(tx.as_mut(), slot.key_name(), &generate_key())
                        .await?;
                    generated.push(slot);
                }
            }
            tx.commit().await?;
            Ok::<_, AdminError>(generated)
        })
        .await?;

        for slot in generated {
            info!(%slot, "Access key generated");
        }
        Ok(())
    }

    pub async fn get_key(&self, slot: KeySlot) -> Result<String> {
        let key = retry_transient("admin.get_key", self.retry.backoff(), move || async move {
            let mut tx = self.store.begin().await?;
            let key = self.keys.try_get(tx.as_mut(), slot.key_name()).await?;
            tx.commit().await?;
            Ok::<_, AdminError>(key)
        })
        .await?;

        match key {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(AdminError::KeyNotInitialized { slot }),
        }
    }

    /// Replace the key in `slot` with a fresh one and return it.
    pub async fn regenerate_key(&self, slot: KeySlot) -> Result<String> {
        let key = retry_transient("admin.regenerate_key", self.retry.backoff(), move || async move {
            let key = generate_key();
            let mut tx = self.store.begin().await?;
            self.keys.set(tx.as_mut(), slot.key_name(), &key).await?;
            tx.commit().await?;
            Ok::<_, AdminError>(key)
        })
        .await?;

        info!(%slot, "Access key regenerated");
        Ok(key)
    }
}
