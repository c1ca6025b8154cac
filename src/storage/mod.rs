//! Store seams used by the snapshot writer and the restore engine.
//!
//! A [`Store`] hands out two kinds of handles: a consistent read scope for
//! exports and a transaction for restores. Both are addressed by table name
//! and speak in [`StoredRow`]s; natural keys never reach this layer.

pub mod memory;
pub mod table;

use async_trait::async_trait;

use crate::core::{FieldMap, LocalId, Result, StoredRow, Value};

pub use memory::{MemoryReadScope, MemoryStore, MemoryTransaction};
pub use table::MemoryTable;

#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn scan(&self, table: &str) -> Result<Vec<StoredRow>>;

    async fn get(&self, table: &str, id: LocalId) -> Result<Option<StoredRow>>;

    /// Rows whose fields equal every `(name, value)` pair.
    async fn find_by_fields(
        &self,
        table: &str,
        criteria: &[(String, Value)],
    ) -> Result<Vec<StoredRow>>;

    async fn count(&self, table: &str) -> Result<usize>;

    async fn max_id(&self, table: &str) -> Result<Option<LocalId>>;
}

/// Writes against a store, visible to nobody else until `commit`.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTransaction: RecordSource {
    /// Inserts a row; `None` draws the table's next sequence value.
    async fn insert(&self, table: &str, id: Option<LocalId>, fields: FieldMap) -> Result<LocalId>;

    /// Overwrites the given fields, leaving the others untouched.
    async fn update(&self, table: &str, id: LocalId, fields: FieldMap) -> Result<()>;

    async fn reset_sequence(&self, table: &str, next: LocalId) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Point-in-time view; later commits are invisible through it.
    async fn read_scope(&self) -> Result<Box<dyn RecordSource>>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}
