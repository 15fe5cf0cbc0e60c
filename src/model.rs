//! Messages and subscriber identities.

use std::fmt;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest accepted subscriber id, in bytes.
pub const MAX_SUBSCRIBER_ID_LEN: usize = 256;

/// A published message.
///
/// The payload is opaque to the broker. `id` and `published_at` are stamped
/// at construction and travel with every delivered copy, so consumers can
/// discard redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: payload.into(),
            published_at: Utc::now(),
        }
    }

    /// Payload as UTF-8, if it is.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<&str> for Message {
    fn from(payload: &str) -> Self {
        Message::new(payload.as_bytes())
    }
}

impl From<String> for Message {
    fn from(payload: String) -> Self {
        Message::new(payload.into_bytes())
    }
}

mod payload_base64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Reasons a subscriber id is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriberIdError {
    #[error("subscriber id is empty")]
    Empty,
    #[error("subscriber id is {0} bytes, limit is {MAX_SUBSCRIBER_ID_LEN}")]
    TooLong(usize),
    #[error("subscriber id contains a control character")]
    ControlCharacter,
}

/// Validated subscriber identity, unique within a topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Result<Self, SubscriberIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(SubscriberIdError::Empty);
        }
        if id.len() > MAX_SUBSCRIBER_ID_LEN {
            return Err(SubscriberIdError::TooLong(id.len()));
        }
        if id.chars().any(char::is_control) {
            return Err(SubscriberIdError::ControlCharacter);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubscriberId {
    type Error = SubscriberIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SubscriberId::new(value)
    }
}

impl From<SubscriberId> for String {
    fn from(id: SubscriberId) -> Self {
        id.0
    }
}

impl AsRef<str> for SubscriberId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
