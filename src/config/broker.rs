//! Topic, broadcast and consumption configuration.

use serde::Deserialize;

use crate::utils::retry::RetryConfig;

/// Identity of the hosted topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Topic name. Also names the SQLite file when no explicit path is set.
    pub name: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
        }
    }
}

/// Broadcast engine tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Messages moved per fan-out transaction.
    pub batch_size: usize,
    /// Backoff for transient storage failures.
    pub retry: RetryConfig,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            retry: RetryConfig::default(),
        }
    }
}

/// Consumer-facing behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumptionConfig {
    /// Register unknown subscribers on their first peek or dequeue.
    pub auto_register: bool,
}

impl Default for ConsumptionConfig {
    fn default() -> Self {
        Self {
            auto_register: true,
        }
    }
}
