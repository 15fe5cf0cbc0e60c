//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Collection catalog: one row per named queue or map.
#[derive(Iden)]
pub enum Collections {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "kind"]
    Kind,
}

/// Queue items, ordered by position within their collection.
#[derive(Iden)]
pub enum QueueItems {
    Table,
    #[iden = "collection"]
    Collection,
    #[iden = "position"]
    Position,
    #[iden = "item"]
    Item,
}

/// Map entries, unique per (collection, key).
#[derive(Iden)]
pub enum MapEntries {
    Table,
    #[iden = "collection"]
    Collection,
    #[iden = "key"]
    Key,
    #[iden = "value"]
    Value,
}

/// SQL for creating the collection catalog.
pub const CREATE_COLLECTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL
)
"#;

/// SQL for creating the queue item table.
pub const CREATE_QUEUE_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue_items (
    collection TEXT NOT NULL,
    position INTEGER NOT NULL,
    item TEXT NOT NULL,
    PRIMARY KEY (collection, position)
)
"#;

/// SQL for creating the map entry table.
pub const CREATE_MAP_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS map_entries (
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (collection, key)
)
"#;
