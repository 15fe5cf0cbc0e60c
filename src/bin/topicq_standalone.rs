//! topicq-standalone: single-topic broker host
//!
//! Opens the topic's state store, makes sure both access keys exist, and
//! runs the broadcast worker until Ctrl+C.
//!
//! ## Configuration
//! ```yaml
//! topic:
//!   name: orders
//! storage:
//!   type: sqlite
//!   sqlite:
//!     directory: ./data
//! broadcast:
//!   batch_size: 16
//! ```
//!
//! The config file path may be given as the first argument or through
//! `TOPICQ_CONFIG`.

use tracing::info;

use topicq::admin::TopicAdmin;
use topicq::broker::Broker;
use topicq::config::Config;
use topicq::storage::init_store;
use topicq::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    let topic = config.topic.name.as_str();

    info!(
        topic = %topic,
        storage = ?config.storage.storage_type,
        batch_size = config.broadcast.batch_size,
        "Starting topicq-standalone"
    );

    let store = init_store(&config.storage, topic)
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    let admin = TopicAdmin::open(store.clone(), &config.broadcast.retry).await?;
    admin.activate().await?;
    info!("Access keys ready");

    let broker = Broker::open(store, &config.broadcast, &config.consumption).await?;
    let subscribers = broker.subscribers().await?;
    let backlog = broker.backlog().await?;
    info!(
        subscribers = subscribers.len(),
        backlog,
        "Topic opened"
    );

    let worker = broker.start();

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    worker.shutdown().await;
    broker.close().await;

    info!("Shutdown complete");
    Ok(())
}
