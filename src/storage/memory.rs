use super::{MemoryTable, RecordSource, Store, StoreTransaction};
use crate::core::{BackupError, FieldMap, LocalId, Result, StoredRow, Value};
use crate::schema::EntityRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

type Tables = im::HashMap<String, MemoryTable>;

/// Reference [`Store`] keeping every table in memory.
///
/// Committed state is a persistent map of tables: read scopes and
/// transactions start from an O(1) clone of it. One transaction may be open
/// at a time; the auto-commit helpers wait for it to finish.
#[derive(Clone, Default)]
pub struct MemoryStore {
    committed: Arc<RwLock<Tables>>,
    writer: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with one sequenced table per registered entity type.
    pub async fn for_registry(registry: &EntityRegistry) -> Self {
        let store = Self::new();
        {
            let mut tables = store.committed.write().await;
            for entity in registry.entity_types() {
                tables.insert(entity.table().to_string(), MemoryTable::new(entity.table()));
            }
        }
        store
    }

    pub async fn create_table(&self, name: &str) -> Result<()> {
        self.add_table(MemoryTable::new(name)).await
    }

    pub async fn create_table_without_sequence(&self, name: &str) -> Result<()> {
        self.add_table(MemoryTable::without_sequence(name)).await
    }

    async fn add_table(&self, table: MemoryTable) -> Result<()> {
        self.autocommit(|tables| {
            if tables.contains_key(table.name()) {
                return Err(BackupError::ConstraintViolation(format!(
                    "table '{}' already exists",
                    table.name()
                )));
            }
            tables.insert(table.name().to_string(), table);
            Ok(())
        })
        .await
    }

    async fn autocommit<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let _gate = self.writer.lock().await;
        let mut tables = self.committed.write().await;
        f(&mut tables)
    }

    pub async fn insert_row(&self, table: &str, fields: FieldMap) -> Result<LocalId> {
        self.autocommit(|tables| table_mut(tables, table)?.insert(None, fields))
            .await
    }

    pub async fn insert_row_with_id(
        &self,
        table: &str,
        id: LocalId,
        fields: FieldMap,
    ) -> Result<LocalId> {
        self.autocommit(|tables| table_mut(tables, table)?.insert(Some(id), fields))
            .await
    }

    pub async fn update_row(&self, table: &str, id: LocalId, fields: FieldMap) -> Result<()> {
        self.autocommit(|tables| table_mut(tables, table)?.update(id, fields))
            .await
    }

    pub async fn delete_row(&self, table: &str, id: LocalId) -> Result<bool> {
        self.autocommit(|tables| Ok(table_mut(tables, table)?.delete(id)))
            .await
    }

    pub async fn rows(&self, table: &str) -> Result<Vec<StoredRow>> {
        let tables = self.committed.read().await;
        Ok(table_ref(&tables, table)?.scan())
    }

    pub async fn row_count(&self, table: &str) -> Result<usize> {
        let tables = self.committed.read().await;
        Ok(table_ref(&tables, table)?.row_count())
    }

    pub async fn next_sequence_value(&self, table: &str) -> Result<Option<LocalId>> {
        let tables = self.committed.read().await;
        Ok(table_ref(&tables, table)?.next_sequence_value())
    }

    /// Concrete read scope; [`Store::read_scope`] boxes the same thing.
    pub async fn read_scope_now(&self) -> MemoryReadScope {
        MemoryReadScope {
            tables: self.committed.read().await.clone(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read_scope(&self) -> Result<Box<dyn RecordSource>> {
        Ok(Box::new(self.read_scope_now().await))
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let gate = self.writer.clone().lock_owned().await;
        let working = self.committed.read().await.clone();
        Ok(Box::new(MemoryTransaction {
            committed: self.committed.clone(),
            working: RwLock::new(working),
            gate: std::sync::Mutex::new(Some(gate)),
        }))
    }
}

fn table_ref<'a>(tables: &'a Tables, name: &str) -> Result<&'a MemoryTable> {
    tables
        .get(name)
        .ok_or_else(|| BackupError::TableNotFound(name.to_string()))
}

fn table_mut<'a>(tables: &'a mut Tables, name: &str) -> Result<&'a mut MemoryTable> {
    tables
        .get_mut(name)
        .ok_or_else(|| BackupError::TableNotFound(name.to_string()))
}

fn find_in(tables: &Tables, table: &str, criteria: &[(String, Value)]) -> Result<Vec<StoredRow>> {
    Ok(table_ref(tables, table)?.find_by_fields(criteria))
}

/// Frozen copy of the committed tables.
pub struct MemoryReadScope {
    tables: Tables,
}

#[async_trait]
impl RecordSource for MemoryReadScope {
    async fn scan(&self, table: &str) -> Result<Vec<StoredRow>> {
        Ok(table_ref(&self.tables, table)?.scan())
    }

    async fn get(&self, table: &str, id: LocalId) -> Result<Option<StoredRow>> {
        Ok(table_ref(&self.tables, table)?.get(id))
    }

    async fn find_by_fields(
        &self,
        table: &str,
        criteria: &[(String, Value)],
    ) -> Result<Vec<StoredRow>> {
        find_in(&self.tables, table, criteria)
    }

    async fn count(&self, table: &str) -> Result<usize> {
        Ok(table_ref(&self.tables, table)?.row_count())
    }

    async fn max_id(&self, table: &str) -> Result<Option<LocalId>> {
        Ok(table_ref(&self.tables, table)?.max_id())
    }
}

/// Working copy of the tables plus the store's writer gate.
pub struct MemoryTransaction {
    committed: Arc<RwLock<Tables>>,
    working: RwLock<Tables>,
    gate: std::sync::Mutex<Option<OwnedMutexGuard<()>>>,
}

impl MemoryTransaction {
    fn ensure_active(&self) -> Result<()> {
        if self.gate.lock()?.is_none() {
            return Err(BackupError::ConstraintViolation(
                "transaction is no longer active".to_string(),
            ));
        }
        Ok(())
    }

    fn finish(&self) -> Result<OwnedMutexGuard<()>> {
        self.gate.lock()?.take().ok_or_else(|| {
            BackupError::ConstraintViolation("transaction is no longer active".to_string())
        })
    }
}

#[async_trait]
impl RecordSource for MemoryTransaction {
    async fn scan(&self, table: &str) -> Result<Vec<StoredRow>> {
        Ok(table_ref(&*self.working.read().await, table)?.scan())
    }

    async fn get(&self, table: &str, id: LocalId) -> Result<Option<StoredRow>> {
        Ok(table_ref(&*self.working.read().await, table)?.get(id))
    }

    async fn find_by_fields(
        &self,
        table: &str,
        criteria: &[(String, Value)],
    ) -> Result<Vec<StoredRow>> {
        find_in(&*self.working.read().await, table, criteria)
    }

    async fn count(&self, table: &str) -> Result<usize> {
        Ok(table_ref(&*self.working.read().await, table)?.row_count())
    }

    async fn max_id(&self, table: &str) -> Result<Option<LocalId>> {
        Ok(table_ref(&*self.working.read().await, table)?.max_id())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn insert(&self, table: &str, id: Option<LocalId>, fields: FieldMap) -> Result<LocalId> {
        self.ensure_active()?;
        let mut tables = self.working.write().await;
        table_mut(&mut tables, table)?.insert(id, fields)
    }

    async fn update(&self, table: &str, id: LocalId, fields: FieldMap) -> Result<()> {
        self.ensure_active()?;
        let mut tables = self.working.write().await;
        table_mut(&mut tables, table)?.update(id, fields)
    }

    async fn reset_sequence(&self, table: &str, next: LocalId) -> Result<()> {
        self.ensure_active()?;
        let mut tables = self.working.write().await;
        table_mut(&mut tables, table)?.reset_sequence(next)
    }

    async fn commit(&self) -> Result<()> {
        let gate = self.finish()?;
        let working = self.working.read().await.clone();
        *self.committed.write().await = working;
        drop(gate);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let gate = self.finish()?;
        drop(gate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("username".into(), Value::from(name));
        fields
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = MemoryStore::new();
        store.create_table("user").await.unwrap();

        let tx = store.begin().await.unwrap();
        tx.insert("user", None, user("alice")).await.unwrap();
        assert_eq!(store.row_count("user").await.unwrap(), 0);
        tx.commit().await.unwrap();

        assert_eq!(store.row_count("user").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        store.create_table("user").await.unwrap();
        store.insert_row("user", user("admin")).await.unwrap();

        let tx = store.begin().await.unwrap();
        tx.insert("user", None, user("alice")).await.unwrap();
        assert_eq!(tx.count("user").await.unwrap(), 2);
        tx.rollback().await.unwrap();

        assert_eq!(store.row_count("user").await.unwrap(), 1);
        assert!(tx.insert("user", None, user("bob")).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_transaction_releases_writer() {
        let store = MemoryStore::new();
        store.create_table("user").await.unwrap();
        {
            let tx = store.begin().await.unwrap();
            tx.insert("user", None, user("alice")).await.unwrap();
        }
        store.insert_row("user", user("bob")).await.unwrap();
        assert_eq!(store.row_count("user").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_scope_is_point_in_time() {
        let store = MemoryStore::new();
        store.create_table("user").await.unwrap();
        store.insert_row("user", user("alice")).await.unwrap();

        let scope = store.read_scope().await.unwrap();
        store.insert_row("user", user("bob")).await.unwrap();

        assert_eq!(scope.count("user").await.unwrap(), 1);
        assert_eq!(store.row_count("user").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let store = MemoryStore::new();
        let scope = store.read_scope().await.unwrap();
        assert!(matches!(
            scope.scan("missing").await,
            Err(BackupError::TableNotFound(_))
        ));
    }
}
