//! StateStore interface tests.
//!
//! These tests verify the contract the broker relies on: FIFO queues,
//! conditional map writes, rollback on drop and change notifications.
//! Every test uses its own collection names so one store can run them all.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use topicq::storage::{
    CollectionKind, ReliableMap, ReliableQueue, StateStore, StorageError, StoreEvent,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub seq: u32,
    pub body: String,
}

pub fn item(seq: u32) -> Item {
    Item {
        seq,
        body: format!("item-{}", seq),
    }
}

/// Discard queued notifications.
fn drain(changes: &mut broadcast::Receiver<StoreEvent>) {
    while changes.try_recv().is_ok() {}
}

// =============================================================================
// Queue tests
// =============================================================================

pub async fn test_queue_fifo<S: StateStore>(store: &S) {
    let queue = ReliableQueue::<Item>::open(store, "test_fifo").await.unwrap();

    let mut tx = store.begin().await.unwrap();
    for seq in 0..5 {
        queue.enqueue(tx.as_mut(), &item(seq)).await.unwrap();
    }
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    for seq in 0..5 {
        let next = queue.try_dequeue(tx.as_mut()).await.unwrap();
        assert_eq!(next, Some(item(seq)), "items must come out in insertion order");
    }
    assert_eq!(queue.try_dequeue(tx.as_mut()).await.unwrap(), None);
    tx.commit().await.unwrap();
}

pub async fn test_queue_empty<S: StateStore>(store: &S) {
    let queue = ReliableQueue::<Item>::named("test_empty");

    let mut tx = store.begin().await.unwrap();
    assert_eq!(queue.try_peek(tx.as_mut()).await.unwrap(), None);
    assert_eq!(queue.try_dequeue(tx.as_mut()).await.unwrap(), None);
    assert_eq!(queue.count(tx.as_mut()).await.unwrap(), 0);
    tx.commit().await.unwrap();
}

pub async fn test_queue_peek_keeps_head<S: StateStore>(store: &S) {
    let queue = ReliableQueue::<Item>::named("test_peek");

    let mut tx = store.begin().await.unwrap();
    queue.enqueue(tx.as_mut(), &item(1)).await.unwrap();
    queue.enqueue(tx.as_mut(), &item(2)).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(queue.try_peek(tx.as_mut()).await.unwrap(), Some(item(1)));
    assert_eq!(queue.try_peek(tx.as_mut()).await.unwrap(), Some(item(1)));
    assert_eq!(queue.count(tx.as_mut()).await.unwrap(), 2);
    assert_eq!(queue.try_dequeue(tx.as_mut()).await.unwrap(), Some(item(1)));
    assert_eq!(queue.try_peek(tx.as_mut()).await.unwrap(), Some(item(2)));
    tx.commit().await.unwrap();
}

pub async fn test_queue_rollback_on_drop<S: StateStore>(store: &S) {
    let queue = ReliableQueue::<Item>::named("test_queue_rollback");

    let mut tx = store.begin().await.unwrap();
    queue.enqueue(tx.as_mut(), &item(1)).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(queue.try_dequeue(tx.as_mut()).await.unwrap(), Some(item(1)));
    queue.enqueue(tx.as_mut(), &item(2)).await.unwrap();
    drop(tx);

    let mut tx = store.begin().await.unwrap();
    assert_eq!(queue.count(tx.as_mut()).await.unwrap(), 1);
    assert_eq!(queue.try_dequeue(tx.as_mut()).await.unwrap(), Some(item(1)));
    tx.commit().await.unwrap();
}

// =============================================================================
// Map tests
// =============================================================================

pub async fn test_map_try_add_is_conditional<S: StateStore>(store: &S) {
    let map = ReliableMap::<bool>::open(store, "test_try_add").await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert!(map.try_add(tx.as_mut(), "s1", &true).await.unwrap());
    assert!(!map.try_add(tx.as_mut(), "s1", &false).await.unwrap());
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(map.try_get(tx.as_mut(), "s1").await.unwrap(), Some(true));
    assert!(map.contains_key(tx.as_mut(), "s1").await.unwrap());
    assert!(!map.contains_key(tx.as_mut(), "s2").await.unwrap());
    tx.commit().await.unwrap();
}

pub async fn test_map_set_overwrites<S: StateStore>(store: &S) {
    let map = ReliableMap::<String>::named("test_set");

    let mut tx = store.begin().await.unwrap();
    map.set(tx.as_mut(), "key1", &"old".to_string()).await.unwrap();
    map.set(tx.as_mut(), "key1", &"new".to_string()).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(
        map.try_get(tx.as_mut(), "key1").await.unwrap().as_deref(),
        Some("new")
    );
    tx.commit().await.unwrap();
}

pub async fn test_map_entries_sorted<S: StateStore>(store: &S) {
    let map = ReliableMap::<u32>::named("test_entries");

    let mut tx = store.begin().await.unwrap();
    map.set(tx.as_mut(), "c", &3).await.unwrap();
    map.set(tx.as_mut(), "a", &1).await.unwrap();
    map.set(tx.as_mut(), "b", &2).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let entries = map.entries(tx.as_mut()).await.unwrap();
    assert_eq!(
        entries,
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("c".to_string(), 3)
        ]
    );
    tx.commit().await.unwrap();
}

pub async fn test_map_rollback_on_drop<S: StateStore>(store: &S) {
    let map = ReliableMap::<bool>::named("test_map_rollback");

    let mut tx = store.begin().await.unwrap();
    map.try_add(tx.as_mut(), "s1", &true).await.unwrap();
    drop(tx);

    let mut tx = store.begin().await.unwrap();
    assert_eq!(map.try_get(tx.as_mut(), "s1").await.unwrap(), None);
    assert!(map.entries(tx.as_mut()).await.unwrap().is_empty());
    tx.commit().await.unwrap();
}

// =============================================================================
// Collection and notification tests
// =============================================================================

pub async fn test_kind_mismatch<S: StateStore>(store: &S) {
    ReliableMap::<bool>::open(store, "test_kind").await.unwrap();

    let err = store
        .attach("test_kind", CollectionKind::Queue)
        .await
        .unwrap_err();
    assert!(
        matches!(err, StorageError::KindMismatch { .. }),
        "expected KindMismatch, got {:?}",
        err
    );
    assert!(!err.is_transient());
}

pub async fn test_open_announces_new_collection<S: StateStore>(store: &S) {
    let mut changes = store.changes();
    drain(&mut changes);

    ReliableQueue::<Item>::open(store, "test_announce").await.unwrap();
    assert_eq!(
        changes.try_recv().unwrap(),
        StoreEvent::CollectionAdded {
            name: "test_announce".to_string()
        }
    );

    // Re-opening an existing collection is silent.
    ReliableQueue::<Item>::open(store, "test_announce").await.unwrap();
    assert!(changes.try_recv().is_err());
}

pub async fn test_only_writing_commits_notify<S: StateStore>(store: &S) {
    let queue = ReliableQueue::<Item>::open(store, "test_notify").await.unwrap();
    let mut changes = store.changes();
    drain(&mut changes);

    let mut tx = store.begin().await.unwrap();
    queue.count(tx.as_mut()).await.unwrap();
    tx.commit().await.unwrap();
    assert!(changes.try_recv().is_err(), "read-only commit must be silent");

    let mut tx = store.begin().await.unwrap();
    queue.enqueue(tx.as_mut(), &item(1)).await.unwrap();
    drop(tx);
    assert!(changes.try_recv().is_err(), "rollback must be silent");

    let mut tx = store.begin().await.unwrap();
    queue.enqueue(tx.as_mut(), &item(1)).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(changes.try_recv().unwrap(), StoreEvent::Committed);
}

pub async fn test_creation_announced_only_on_commit<S: StateStore>(store: &S) {
    let queue = ReliableQueue::<Item>::named("test_lazy_create");
    let mut changes = store.changes();
    drain(&mut changes);

    let mut tx = store.begin().await.unwrap();
    queue.enqueue(tx.as_mut(), &item(1)).await.unwrap();
    drop(tx);
    assert!(
        changes.try_recv().is_err(),
        "rolled-back creation must be silent"
    );

    let mut tx = store.begin().await.unwrap();
    queue.enqueue(tx.as_mut(), &item(1)).await.unwrap();
    assert!(changes.try_recv().is_err(), "nothing is announced before commit");
    tx.commit().await.unwrap();
    assert_eq!(
        changes.try_recv().unwrap(),
        StoreEvent::CollectionAdded {
            name: "test_lazy_create".to_string()
        }
    );
    assert_eq!(changes.try_recv().unwrap(), StoreEvent::Committed);
}

/// Closes the store, so it must run last.
pub async fn test_close_rejects_new_work<S: StateStore>(store: &S) {
    store.close().await;

    assert!(matches!(store.begin().await, Err(StorageError::Closed)));
    assert!(matches!(
        ReliableQueue::<Item>::open(store, "test_after_close").await,
        Err(StorageError::Closed)
    ));
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all StateStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_state_store_tests {
    ($store:expr) => {
        use $crate::storage::state_store_tests::*;

        // queue tests
        test_queue_fifo($store).await;
        println!("  test_queue_fifo: PASSED");

        test_queue_empty($store).await;
        println!("  test_queue_empty: PASSED");

        test_queue_peek_keeps_head($store).await;
        println!("  test_queue_peek_keeps_head: PASSED");

        test_queue_rollback_on_drop($store).await;
        println!("  test_queue_rollback_on_drop: PASSED");

        // map tests
        test_map_try_add_is_conditional($store).await;
        println!("  test_map_try_add_is_conditional: PASSED");

        test_map_set_overwrites($store).await;
        println!("  test_map_set_overwrites: PASSED");

        test_map_entries_sorted($store).await;
        println!("  test_map_entries_sorted: PASSED");

        test_map_rollback_on_drop($store).await;
        println!("  test_map_rollback_on_drop: PASSED");

        // collection tests
        test_kind_mismatch($store).await;
        println!("  test_kind_mismatch: PASSED");

        test_open_announces_new_collection($store).await;
        println!("  test_open_announces_new_collection: PASSED");

        test_only_writing_commits_notify($store).await;
        println!("  test_only_writing_commits_notify: PASSED");

        test_creation_announced_only_on_commit($store).await;
        println!("  test_creation_announced_only_on_commit: PASSED");

        // lifecycle, closes the store
        test_close_rejects_new_work($store).await;
        println!("  test_close_rejects_new_work: PASSED");
    };
}
