//! Typed handles over named collections.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CollectionKind, PutMode, Result, StateStore, Transaction};

/// Handle to a named FIFO queue of `T`.
///
/// The handle holds no state beyond the name; every operation runs inside
/// the caller's transaction.
#[derive(Debug)]
pub struct ReliableQueue<T> {
    name: String,
    _item: PhantomData<fn() -> T>,
}

impl<T> Clone for ReliableQueue<T> {
    fn clone(&self) -> Self {
        Self::named(self.name.clone())
    }
}

impl<T> ReliableQueue<T> {
    /// Refer to a queue by name; storage is created on first access.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _item: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: Serialize + DeserializeOwned> ReliableQueue<T> {
    /// Get or create the queue.
    pub async fn open(store: &dyn StateStore, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        store.attach(&name, CollectionKind::Queue).await?;
        Ok(Self::named(name))
    }

    pub async fn enqueue(&self, tx: &mut dyn Transaction, item: &T) -> Result<()> {
        let encoded = serde_json::to_string(item)?;
        tx.push_back(&self.name, encoded).await
    }

    pub async fn try_dequeue(&self, tx: &mut dyn Transaction) -> Result<Option<T>> {
        decode(tx.pop_front(&self.name).await?)
    }

    pub async fn try_peek(&self, tx: &mut dyn Transaction) -> Result<Option<T>> {
        decode(tx.peek_front(&self.name).await?)
    }

    pub async fn count(&self, tx: &mut dyn Transaction) -> Result<u64> {
        tx.queue_len(&self.name).await
    }
}

/// Handle to a named string-keyed map of `V`.
#[derive(Debug)]
pub struct ReliableMap<V> {
    name: String,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for ReliableMap<V> {
    fn clone(&self) -> Self {
        Self::named(self.name.clone())
    }
}

impl<V> ReliableMap<V> {
    /// Refer to a map by name; storage is created on first access.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<V: Serialize + DeserializeOwned> ReliableMap<V> {
    /// Get or create the map.
    pub async fn open(store: &dyn StateStore, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        store.attach(&name, CollectionKind::Map).await?;
        Ok(Self::named(name))
    }

    pub async fn try_get(&self, tx: &mut dyn Transaction, key: &str) -> Result<Option<V>> {
        decode(tx.map_get(&self.name, key).await?)
    }

    /// Insert only if `key` is absent. Returns whether the entry was added.
    pub async fn try_add(&self, tx: &mut dyn Transaction, key: &str, value: &V) -> Result<bool> {
        let encoded = serde_json::to_string(value)?;
        tx.map_put(&self.name, key, encoded, PutMode::IfAbsent).await
    }

    pub async fn set(&self, tx: &mut dyn Transaction, key: &str, value: &V) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        tx.map_put(&self.name, key, encoded, PutMode::Overwrite)
            .await
            .map(|_| ())
    }

    pub async fn contains_key(&self, tx: &mut dyn Transaction, key: &str) -> Result<bool> {
        Ok(tx.map_get(&self.name, key).await?.is_some())
    }

    /// All entries, ordered by key.
    pub async fn entries(&self, tx: &mut dyn Transaction) -> Result<Vec<(String, V)>> {
        tx.map_entries(&self.name)
            .await?
            .into_iter()
            .map(|(key, raw)| -> Result<(String, V)> { Ok((key, serde_json::from_str(&raw)?)) })
            .collect()
    }
}

fn decode<T: DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
    raw.map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(Into::into)
}
