//! Durable collection substrate.
//!
//! This module contains:
//! - `StateStore` trait: named ordered queues and key-value maps behind
//!   atomic, isolated transactions
//! - `Transaction` trait: a single unit of work; dropping it without
//!   `commit()` rolls back every change made under it
//! - `ReliableQueue` / `ReliableMap`: typed handles over named collections
//! - Implementations: in-memory (always available), SQLite (`sqlite` feature)

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::{StorageConfig, StorageType};
use crate::utils::retry::Transient;

mod handles;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use handles::{ReliableMap, ReliableQueue};
pub use memory::MemoryStateStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;

/// Capacity of the change-notification feed.
pub(crate) const CHANGE_FEED_CAPACITY: usize = 256;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Timed out waiting for lock on collection '{collection}'")]
    LockTimeout { collection: String },

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Collection '{name}' is a {actual}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: CollectionKind,
        actual: CollectionKind,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State store is closed")]
    Closed,
}

impl StorageError {
    /// Whether retrying the whole operation may succeed.
    ///
    /// Lock timeouts and isolation conflicts clear once the competing
    /// transaction finishes. Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::LockTimeout { .. } | StorageError::Conflict(_) => true,
            #[cfg(feature = "sqlite")]
            StorageError::Database(e) => sqlite::is_busy(e),
            _ => false,
        }
    }
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}

/// The two collection shapes the substrate offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Queue,
    Map,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Queue => "queue",
            CollectionKind::Map => "map",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "queue" => Some(CollectionKind::Queue),
            "map" => Some(CollectionKind::Map),
            _ => None,
        }
    }
}

impl std::fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change notification emitted by a state store.
///
/// Carries no detail beyond "something changed"; listeners re-check state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A collection was created.
    CollectionAdded { name: String },
    /// A transaction that wrote at least one change committed.
    Committed,
}

/// Conditional write mode for map entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Only write when the key is absent.
    IfAbsent,
    /// Always write, replacing any existing value.
    Overwrite,
}

/// A unit of work over one or more collections.
///
/// Values cross this boundary as serialized JSON; the typed handles in
/// `ReliableQueue` / `ReliableMap` do the encoding. A collection touched for
/// the first time is created with the kind implied by the operation.
///
/// Isolation is pessimistic: a collection touched by one transaction is
/// unavailable to others until the first commits or is dropped.
#[async_trait]
pub trait Transaction: Send {
    /// Append an item at the tail of a queue.
    async fn push_back(&mut self, queue: &str, item: String) -> Result<()>;

    /// Remove and return the head of a queue.
    async fn pop_front(&mut self, queue: &str) -> Result<Option<String>>;

    /// Return the head of a queue without removing it.
    async fn peek_front(&mut self, queue: &str) -> Result<Option<String>>;

    /// Number of items in a queue.
    async fn queue_len(&mut self, queue: &str) -> Result<u64>;

    /// Look up a map entry.
    async fn map_get(&mut self, map: &str, key: &str) -> Result<Option<String>>;

    /// Write a map entry. Returns whether the value was written.
    async fn map_put(&mut self, map: &str, key: &str, value: String, mode: PutMode)
        -> Result<bool>;

    /// All entries of a map, ordered by key.
    async fn map_entries(&mut self, map: &str) -> Result<Vec<(String, String)>>;

    /// Make every change durable and visible, then release all locks.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Interface to the transactional collection substrate.
///
/// Implementations:
/// - `MemoryStateStore`: in-process, per-collection locks
/// - `SqliteStateStore`: durable, SQLite database file
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create the named collection if it does not exist.
    ///
    /// Fails with `KindMismatch` if the name is taken by the other kind.
    async fn attach(&self, name: &str, kind: CollectionKind) -> Result<()>;

    /// Start a new transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Subscribe to the change-notification feed.
    fn changes(&self) -> broadcast::Receiver<StoreEvent>;

    /// Stop accepting work. Later `attach` and `begin` calls fail with
    /// `Closed`; a transaction already open may still commit.
    async fn close(&self);
}

/// Initialize the state store for a topic based on configuration.
pub async fn init_store(
    config: &StorageConfig,
    topic: &str,
) -> std::result::Result<Arc<dyn StateStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        StorageType::Memory => {
            info!(topic = %topic, storage_type = "memory", "State store initialized");
            Ok(Arc::new(MemoryStateStore::new(config.lock_timeout())))
        }
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let path = config.sqlite.database_path(topic);
                let store = SqliteStateStore::open(&path, config.lock_timeout()).await?;
                info!(topic = %topic, storage_type = "sqlite", path = %path.display(), "State store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                error!("SQLite storage requested but 'sqlite' feature is not enabled");
                Err("SQLite support requires the 'sqlite' feature. Rebuild with --features sqlite".into())
            }
        }
    }
}

/// Remove the persisted state of a topic, if the backend keeps any.
pub async fn destroy_store(config: &StorageConfig, topic: &str) -> std::io::Result<()> {
    match config.storage_type {
        StorageType::Memory => Ok(()),
        StorageType::Sqlite => {
            let path = config.sqlite.database_path(topic);
            for suffix in ["", "-wal", "-shm"] {
                let mut file = path.clone().into_os_string();
                file.push(suffix);
                match tokio::fs::remove_file(&file).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        error!(topic = %topic, error = %e, "Failed to remove topic state");
                        return Err(e);
                    }
                }
            }
            info!(topic = %topic, "Topic state removed");
            Ok(())
        }
    }
}
