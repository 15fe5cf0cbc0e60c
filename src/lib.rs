//! topicq - durable topic broker
//!
//! Producers publish into a topic; every registered subscriber receives its
//! own ordered, durable copy of each message published after it registered.
//! Fan-out runs as transactions over a pluggable state store, so a crash at
//! any point loses nothing (delivery is at-least-once).

pub mod admin;
pub mod broker;
pub mod config;
pub mod model;
pub mod storage;
pub mod utils;

pub use broker::{Broker, BrokerError, Topic};
pub use model::{Message, SubscriberId};
