use std::path::Path;
use std::sync::Arc;

use crate::core::Result;
use crate::restore::{RestoreEngine, RestoreOptions, RestoreReport, validate_completeness};
use crate::schema::EntityRegistry;
use crate::snapshot::{
    ExportOptions, SnapshotHandle, SnapshotManifest, SnapshotReader, SnapshotWriter,
};
use crate::storage::Store;

/// Entry point for callers: one registry, one store.
///
/// ```
/// use natkey_backup::{
///     BackupEngine, ConflictPolicy, EntityRegistry, EntityType, ExportOptions, FieldMap,
///     MemoryStore, RestoreOptions, Value,
/// };
///
/// # tokio_test::block_on(async {
/// let registry = EntityRegistry::builder()
///     .entity(EntityType::new("user").text_field("username").natural_key(&["username"]))
///     .build()?;
/// let store = MemoryStore::for_registry(&registry).await;
/// let mut alice = FieldMap::new();
/// alice.insert("username".into(), Value::from("alice"));
/// store.insert_row("user", alice).await?;
///
/// let dir = tempfile::TempDir::new()?;
/// let source = BackupEngine::new(registry.clone(), store);
/// let snapshot = source
///     .create_snapshot(&[], dir.path(), ExportOptions::default())
///     .await?;
///
/// let target = BackupEngine::new(registry.clone(), MemoryStore::for_registry(&registry).await);
/// let report = target
///     .restore(&snapshot, &RestoreOptions::new(ConflictPolicy::StrictEmpty))
///     .await?;
/// assert!(report.is_complete());
/// # Ok::<(), natkey_backup::BackupError>(())
/// # }).unwrap();
/// ```
pub struct BackupEngine<S: Store> {
    registry: Arc<EntityRegistry>,
    store: Arc<S>,
}

impl<S: Store> Clone for BackupEngine<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            store: self.store.clone(),
        }
    }
}

impl<S: Store> BackupEngine<S> {
    pub fn new(registry: EntityRegistry, store: S) -> Self {
        Self::shared(Arc::new(registry), Arc::new(store))
    }

    pub fn shared(registry: Arc<EntityRegistry>, store: Arc<S>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Exports `entity_types` into `output`. An empty list exports every
    /// registered type.
    pub async fn create_snapshot(
        &self,
        entity_types: &[&str],
        output: impl AsRef<Path>,
        options: ExportOptions,
    ) -> Result<SnapshotHandle> {
        let handle = SnapshotHandle::new(output.as_ref());
        SnapshotWriter::new(&self.registry, options)
            .write(self.store.as_ref(), entity_types, handle.root())
            .await?;
        Ok(handle)
    }

    /// Restores `snapshot` into this engine's store.
    pub async fn restore(
        &self,
        snapshot: &SnapshotHandle,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        RestoreEngine::new(&self.registry, self.store.as_ref())
            .restore(snapshot, options)
            .await
    }

    /// Counts this engine's store against the manifest's expected counts.
    pub async fn validate_completeness(
        &self,
        manifest: &SnapshotManifest,
    ) -> Result<RestoreReport> {
        validate_completeness(&self.registry, manifest, self.store.as_ref()).await
    }

    pub async fn verify(&self, snapshot: &SnapshotHandle) -> Result<bool> {
        SnapshotReader::open(snapshot).await?.verify().await
    }

    pub async fn read_manifest(&self, snapshot: &SnapshotHandle) -> Result<SnapshotManifest> {
        Ok(SnapshotReader::open(snapshot).await?.manifest().clone())
    }
}
