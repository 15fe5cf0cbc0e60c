//! In-memory state store.
//!
//! Every collection sits behind its own `tokio::sync::Mutex`. A transaction
//! takes the lock of each collection it touches and keeps it until commit or
//! drop, mutating in place and recording an undo log. Dropping an uncommitted
//! transaction replays the undo log in reverse before the locks are released,
//! and forgets any collection it created. Creation is announced on the
//! change feed only once the creating transaction commits.
//!
//! Not durable: state lives as long as the store. Used for tests and local
//! development, and as the reference behaviour for other backends.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

use super::{
    CollectionKind, PutMode, Result, StateStore, StorageError, StoreEvent, Transaction,
    CHANGE_FEED_CAPACITY,
};

/// Default time a transaction waits for a collection lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(4);

enum Collection {
    Queue(VecDeque<String>),
    Map(BTreeMap<String, String>),
}

impl Collection {
    fn empty(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Queue => Collection::Queue(VecDeque::new()),
            CollectionKind::Map => Collection::Map(BTreeMap::new()),
        }
    }
}

struct Slot {
    kind: CollectionKind,
    state: Arc<Mutex<Collection>>,
}

struct Inner {
    slots: StdMutex<HashMap<String, Slot>>,
    events: broadcast::Sender<StoreEvent>,
    lock_timeout: Duration,
    fail_on_commit: AtomicBool,
    closed: AtomicBool,
    next_tx: AtomicU64,
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Get or create a collection, checking its kind. The flag is true when
    /// this call created it.
    fn slot(&self, name: &str, kind: CollectionKind) -> Result<(Arc<Mutex<Collection>>, bool)> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let slot = entry.get();
                if slot.kind != kind {
                    return Err(StorageError::KindMismatch {
                        name: name.to_string(),
                        expected: kind,
                        actual: slot.kind,
                    });
                }
                Ok((Arc::clone(&slot.state), false))
            }
            Entry::Vacant(entry) => {
                let state = Arc::new(Mutex::new(Collection::empty(kind)));
                entry.insert(Slot {
                    kind,
                    state: Arc::clone(&state),
                });
                debug!(collection = %name, kind = %kind, "Collection created");
                Ok((state, true))
            }
        }
    }

    fn announce(&self, name: &str) {
        let _ = self.events.send(StoreEvent::CollectionAdded {
            name: name.to_string(),
        });
    }

    /// Forget a collection created by a rolled-back transaction, unless
    /// another transaction already holds a handle to it.
    fn discard(&self, name: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Entry::Occupied(entry) = slots.entry(name.to_string()) {
            if Arc::strong_count(&entry.get().state) == 1 {
                entry.remove();
                debug!(collection = %name, "Uncommitted collection discarded");
            }
        }
    }
}

/// In-memory implementation of `StateStore`.
#[derive(Clone)]
pub struct MemoryStateStore {
    inner: Arc<Inner>,
}

impl MemoryStateStore {
    /// Create an empty store whose transactions wait at most `lock_timeout`
    /// for each collection lock.
    pub fn new(lock_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                slots: StdMutex::new(HashMap::new()),
                events,
                lock_timeout,
                fail_on_commit: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    /// Make every subsequent commit fail with a transient conflict.
    ///
    /// The failing transaction is rolled back, exactly as a real isolation
    /// conflict would be.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.inner.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Names of all collections created so far, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        let slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = slots.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn attach(&self, name: &str, kind: CollectionKind) -> Result<()> {
        self.inner.ensure_open()?;
        let (_, created) = self.inner.slot(name, kind)?;
        if created {
            self.inner.announce(name);
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.inner.ensure_open()?;
        let id = self.inner.next_tx.fetch_add(1, Ordering::Relaxed);
        trace!(tx = id, "Transaction started");
        Ok(Box::new(MemoryTransaction {
            id,
            store: Arc::clone(&self.inner),
            locks: HashMap::new(),
            undo: Vec::new(),
            created: Vec::new(),
        }))
    }

    fn changes(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("Memory state store closed");
        }
    }
}

/// Inverse of one applied mutation.
enum Undo {
    PushedBack { queue: String },
    PoppedFront { queue: String, item: String },
    Put {
        map: String,
        key: String,
        previous: Option<String>,
    },
}

struct MemoryTransaction {
    id: u64,
    store: Arc<Inner>,
    locks: HashMap<String, OwnedMutexGuard<Collection>>,
    undo: Vec<Undo>,
    /// Collections this transaction brought into existence, announced on
    /// commit.
    created: Vec<String>,
}

impl MemoryTransaction {
    /// Lock a collection for the rest of the transaction.
    async fn acquire(&mut self, name: &str, kind: CollectionKind) -> Result<&mut Collection> {
        let guard = match self.locks.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (state, created) = self.store.slot(name, kind)?;
                if created {
                    self.created.push(name.to_string());
                }
                let guard = tokio::time::timeout(self.store.lock_timeout, state.lock_owned())
                    .await
                    .map_err(|_| StorageError::LockTimeout {
                        collection: name.to_string(),
                    })?;
                trace!(tx = self.id, collection = %name, "Lock acquired");
                entry.insert(guard)
            }
        };
        Ok(&mut **guard)
    }

    async fn queue(&mut self, name: &str) -> Result<&mut VecDeque<String>> {
        match self.acquire(name, CollectionKind::Queue).await? {
            Collection::Queue(items) => Ok(items),
            Collection::Map(_) => Err(StorageError::KindMismatch {
                name: name.to_string(),
                expected: CollectionKind::Queue,
                actual: CollectionKind::Map,
            }),
        }
    }

    async fn map(&mut self, name: &str) -> Result<&mut BTreeMap<String, String>> {
        match self.acquire(name, CollectionKind::Map).await? {
            Collection::Map(entries) => Ok(entries),
            Collection::Queue(_) => Err(StorageError::KindMismatch {
                name: name.to_string(),
                expected: CollectionKind::Map,
                actual: CollectionKind::Queue,
            }),
        }
    }

    fn rollback(&mut self) {
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::PushedBack { queue } => {
                    if let Some(Collection::Queue(items)) = self.locks.get_mut(&queue).map(|g| &mut **g) {
                        items.pop_back();
                    }
                }
                Undo::PoppedFront { queue, item } => {
                    if let Some(Collection::Queue(items)) = self.locks.get_mut(&queue).map(|g| &mut **g) {
                        items.push_front(item);
                    }
                }
                Undo::Put { map, key, previous } => {
                    if let Some(Collection::Map(entries)) = self.locks.get_mut(&map).map(|g| &mut **g) {
                        match previous {
                            Some(value) => {
                                entries.insert(key, value);
                            }
                            None => {
                                entries.remove(&key);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn push_back(&mut self, queue: &str, item: String) -> Result<()> {
        self.queue(queue).await?.push_back(item);
        self.undo.push(Undo::PushedBack {
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn pop_front(&mut self, queue: &str) -> Result<Option<String>> {
        let item = self.queue(queue).await?.pop_front();
        if let Some(ref item) = item {
            self.undo.push(Undo::PoppedFront {
                queue: queue.to_string(),
                item: item.clone(),
            });
        }
        Ok(item)
    }

    async fn peek_front(&mut self, queue: &str) -> Result<Option<String>> {
        Ok(self.queue(queue).await?.front().cloned())
    }

    async fn queue_len(&mut self, queue: &str) -> Result<u64> {
        Ok(self.queue(queue).await?.len() as u64)
    }

    async fn map_get(&mut self, map: &str, key: &str) -> Result<Option<String>> {
        Ok(self.map(map).await?.get(key).cloned())
    }

    async fn map_put(
        &mut self,
        map: &str,
        key: &str,
        value: String,
        mode: PutMode,
    ) -> Result<bool> {
        let entries = self.map(map).await?;
        if mode == PutMode::IfAbsent && entries.contains_key(key) {
            return Ok(false);
        }
        let previous = entries.insert(key.to_string(), value);
        self.undo.push(Undo::Put {
            map: map.to_string(),
            key: key.to_string(),
            previous,
        });
        Ok(true)
    }

    async fn map_entries(&mut self, map: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .map(map)
            .await?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if self.store.fail_on_commit.load(Ordering::SeqCst) {
            debug!(tx = self.id, "Injected commit failure, rolling back");
            // Drop rolls back.
            return Err(StorageError::Conflict(format!(
                "commit of transaction {} rejected",
                self.id
            )));
        }

        let wrote = !self.undo.is_empty();
        self.undo.clear();
        self.locks.clear();
        trace!(tx = self.id, wrote, "Transaction committed");

        for name in std::mem::take(&mut self.created) {
            self.store.announce(&name);
        }
        if wrote {
            let _ = self.store.events.send(StoreEvent::Committed);
        }
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            debug!(tx = self.id, changes = self.undo.len(), "Rolling back uncommitted transaction");
            self.rollback();
        }
        self.locks.clear();
        for name in std::mem::take(&mut self.created) {
            self.store.discard(&name);
        }
    }
}
