//! Storage configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Storage type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Memory,
    Sqlite,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// How long a transaction waits for a lock before failing transiently.
    pub lock_timeout_ms: u64,
    /// SQLite-specific configuration.
    pub sqlite: SqliteConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Memory,
            lock_timeout_ms: 4000,
            sqlite: SqliteConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Explicit database file for the single-topic binary. Overrides
    /// `directory`; a topic catalog refuses it.
    pub path: Option<String>,
    /// Directory holding one `<topic>.db` file per topic.
    pub directory: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: None,
            directory: "./data".to_string(),
        }
    }
}

impl SqliteConfig {
    /// Database file for a topic.
    pub fn database_path(&self, topic: &str) -> PathBuf {
        match &self.path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(&self.directory).join(format!("{}.db", topic)),
        }
    }
}
