//! SQLite implementation of the state store.
//!
//! Queues and maps share one database file. Each `Transaction` is a SQLite
//! transaction on a pooled connection; sqlx rolls it back when the handle is
//! dropped without commit. SQLite serializes writers, so isolation is
//! database-wide rather than per collection; lock waits are bounded by the
//! busy timeout and surface as transient errors.

mod schema;

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tokio::sync::broadcast;
use tracing::{debug, info};

use self::schema::{
    Collections, MapEntries, QueueItems, CREATE_COLLECTIONS_TABLE, CREATE_MAP_ENTRIES_TABLE,
    CREATE_QUEUE_ITEMS_TABLE,
};
use super::{
    CollectionKind, PutMode, Result, StateStore, StorageError, StoreEvent, Transaction,
    CHANGE_FEED_CAPACITY,
};

/// Whether a database error means "another writer holds the lock".
pub(crate) fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            // Primary result code lives in the low byte of extended codes.
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}

/// SQLite-backed `StateStore`.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
    events: broadcast::Sender<StoreEvent>,
}

impl SqliteStateStore {
    /// Open (creating if missing) a database file.
    pub async fn open(path: &Path, lock_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(lock_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(lock_timeout)
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "SQLite state store opened");
        Self::with_pool(pool).await
    }

    /// Open a private in-memory database.
    ///
    /// Limited to a single connection, so concurrent transactions queue on
    /// the pool instead of on SQLite locks.
    pub async fn in_memory(lock_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(lock_timeout)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for ddl in [
            CREATE_COLLECTIONS_TABLE,
            CREATE_QUEUE_ITEMS_TABLE,
            CREATE_MAP_ENTRIES_TABLE,
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        let (events, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self { pool, events })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.pool.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

/// Look up a collection's kind, creating it if absent.
///
/// Returns `true` if the collection was created.
async fn ensure_collection(
    conn: &mut SqliteConnection,
    name: &str,
    kind: CollectionKind,
) -> Result<bool> {
    let select = Query::select()
        .column(Collections::Kind)
        .from(Collections::Table)
        .and_where(Expr::col(Collections::Name).eq(name))
        .to_string(SqliteQueryBuilder);

    if let Some(row) = sqlx::query(&select).fetch_optional(&mut *conn).await? {
        let stored: String = row.get("kind");
        let actual = CollectionKind::parse(&stored).ok_or_else(|| {
            StorageError::Conflict(format!("collection '{}' has unknown kind '{}'", name, stored))
        })?;
        if actual != kind {
            return Err(StorageError::KindMismatch {
                name: name.to_string(),
                expected: kind,
                actual,
            });
        }
        return Ok(false);
    }

    let insert = Query::insert()
        .into_table(Collections::Table)
        .columns([Collections::Name, Collections::Kind])
        .values_panic([name.into(), kind.as_str().into()])
        .on_conflict(OnConflict::column(Collections::Name).do_nothing().to_owned())
        .to_string(SqliteQueryBuilder);

    let created = sqlx::query(&insert).execute(&mut *conn).await?.rows_affected() == 1;
    if created {
        debug!(collection = %name, kind = %kind, "Collection created");
    }
    Ok(created)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn attach(&self, name: &str, kind: CollectionKind) -> Result<()> {
        self.ensure_open()?;
        let mut conn = self.pool.acquire().await?;
        if ensure_collection(&mut conn, name, kind).await? {
            let _ = self.events.send(StoreEvent::CollectionAdded {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction {
            tx,
            events: self.events.clone(),
            known: HashSet::new(),
            created: Vec::new(),
            wrote: false,
        }))
    }

    fn changes(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Close the pool, waiting for open connections to be returned.
    async fn close(&self) {
        self.pool.close().await;
    }
}

struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
    events: broadcast::Sender<StoreEvent>,
    /// Collections already checked in this transaction.
    known: HashSet<String>,
    /// Collections created by this transaction, announced on commit.
    created: Vec<String>,
    wrote: bool,
}

impl SqliteTransaction {
    async fn ensure(&mut self, name: &str, kind: CollectionKind) -> Result<()> {
        if self.known.contains(name) {
            return Ok(());
        }
        if ensure_collection(&mut self.tx, name, kind).await? {
            self.created.push(name.to_string());
        }
        self.known.insert(name.to_string());
        Ok(())
    }

    async fn head(&mut self, queue: &str) -> Result<Option<(i64, String)>> {
        self.ensure(queue, CollectionKind::Queue).await?;

        let select = Query::select()
            .columns([QueueItems::Position, QueueItems::Item])
            .from(QueueItems::Table)
            .and_where(Expr::col(QueueItems::Collection).eq(queue))
            .order_by(QueueItems::Position, Order::Asc)
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&select).fetch_optional(&mut *self.tx).await?;
        Ok(row.map(|row| (row.get("position"), row.get("item"))))
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn push_back(&mut self, queue: &str, item: String) -> Result<()> {
        self.ensure(queue, CollectionKind::Queue).await?;

        let tail = Query::select()
            .expr(Expr::col(QueueItems::Position).max())
            .from(QueueItems::Table)
            .and_where(Expr::col(QueueItems::Collection).eq(queue))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&tail).fetch_one(&mut *self.tx).await?;
        let position = row.get::<Option<i64>, _>(0).unwrap_or(0) + 1;

        let insert = Query::insert()
            .into_table(QueueItems::Table)
            .columns([QueueItems::Collection, QueueItems::Position, QueueItems::Item])
            .values_panic([queue.into(), position.into(), item.into()])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&insert).execute(&mut *self.tx).await?;
        self.wrote = true;
        Ok(())
    }

    async fn pop_front(&mut self, queue: &str) -> Result<Option<String>> {
        let Some((position, item)) = self.head(queue).await? else {
            return Ok(None);
        };

        let delete = Query::delete()
            .from_table(QueueItems::Table)
            .and_where(Expr::col(QueueItems::Collection).eq(queue))
            .and_where(Expr::col(QueueItems::Position).eq(position))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&delete).execute(&mut *self.tx).await?;
        self.wrote = true;
        Ok(Some(item))
    }

    async fn peek_front(&mut self, queue: &str) -> Result<Option<String>> {
        Ok(self.head(queue).await?.map(|(_, item)| item))
    }

    async fn queue_len(&mut self, queue: &str) -> Result<u64> {
        self.ensure(queue, CollectionKind::Queue).await?;

        let count = Query::select()
            .expr(Expr::col(QueueItems::Position).count())
            .from(QueueItems::Table)
            .and_where(Expr::col(QueueItems::Collection).eq(queue))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&count).fetch_one(&mut *self.tx).await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn map_get(&mut self, map: &str, key: &str) -> Result<Option<String>> {
        self.ensure(map, CollectionKind::Map).await?;

        let select = Query::select()
            .column(MapEntries::Value)
            .from(MapEntries::Table)
            .and_where(Expr::col(MapEntries::Collection).eq(map))
            .and_where(Expr::col(MapEntries::Key).eq(key))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&select).fetch_optional(&mut *self.tx).await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn map_put(
        &mut self,
        map: &str,
        key: &str,
        value: String,
        mode: PutMode,
    ) -> Result<bool> {
        self.ensure(map, CollectionKind::Map).await?;

        let conflict = match mode {
            PutMode::IfAbsent => OnConflict::columns([MapEntries::Collection, MapEntries::Key])
                .do_nothing()
                .to_owned(),
            PutMode::Overwrite => OnConflict::columns([MapEntries::Collection, MapEntries::Key])
                .update_column(MapEntries::Value)
                .to_owned(),
        };

        let insert = Query::insert()
            .into_table(MapEntries::Table)
            .columns([MapEntries::Collection, MapEntries::Key, MapEntries::Value])
            .values_panic([map.into(), key.into(), value.into()])
            .on_conflict(conflict)
            .to_string(SqliteQueryBuilder);

        let written = sqlx::query(&insert)
            .execute(&mut *self.tx)
            .await?
            .rows_affected()
            == 1;
        if written {
            self.wrote = true;
        }
        Ok(written)
    }

    async fn map_entries(&mut self, map: &str) -> Result<Vec<(String, String)>> {
        self.ensure(map, CollectionKind::Map).await?;

        let select = Query::select()
            .columns([MapEntries::Key, MapEntries::Value])
            .from(MapEntries::Table)
            .and_where(Expr::col(MapEntries::Collection).eq(map))
            .order_by(MapEntries::Key, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&mut *self.tx).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let SqliteTransaction {
            tx,
            events,
            created,
            wrote,
            ..
        } = *self;

        tx.commit().await?;

        for name in created {
            let _ = events.send(StoreEvent::CollectionAdded { name });
        }
        if wrote {
            let _ = events.send(StoreEvent::Committed);
        }
        Ok(())
    }
}
