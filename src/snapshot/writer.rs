use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

use super::format::{
    AssociationRecord, EntityRecord, ExportMode, ForeignKeyRef, MANIFEST_FILE, SCHEMA_VERSION,
    SNAPSHOT_FORMAT, SectionEncoding, SectionEntry, SectionKind, SnapshotHandle, SnapshotManifest,
    sha256_hex,
};
use crate::core::{BackupError, FieldMap, LocalId, NaturalKey, Result, StoredRow, Value};
use crate::schema::{EntityKind, EntityRegistry, EntityType, ForeignKeyField};
use crate::storage::{RecordSource, Store};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    pub mode: ExportMode,
    pub encoding: SectionEncoding,
}

impl ExportOptions {
    pub fn permissive() -> Self {
        Self {
            mode: ExportMode::Permissive,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: ExportMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_encoding(mut self, encoding: SectionEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

/// Natural keys of every exported keyed type, by source id.
type KeyIndex = HashMap<String, HashMap<LocalId, NaturalKey>>;

/// Serializes a store into a snapshot container.
pub struct SnapshotWriter<'a> {
    registry: &'a EntityRegistry,
    options: ExportOptions,
}

impl<'a> SnapshotWriter<'a> {
    pub fn new(registry: &'a EntityRegistry, options: ExportOptions) -> Self {
        Self { registry, options }
    }

    /// Exports `entity_types` (every registered type when empty) from `store`
    /// into the directory `output`.
    ///
    /// All rows are read through one read scope. Section files are written
    /// first and the manifest last, so a directory without `manifest.json` is
    /// never a usable snapshot.
    pub async fn write<S>(
        &self,
        store: &S,
        entity_types: &[&str],
        output: impl AsRef<Path>,
    ) -> Result<SnapshotManifest>
    where
        S: Store + ?Sized,
    {
        let handle = SnapshotHandle::new(output.as_ref());
        let span = info_span!(
            "snapshot.write",
            output = %handle.root().display(),
            mode = ?self.options.mode,
            encoding = ?self.options.encoding
        );
        async move {
            let result = self.write_inner(store, entity_types, &handle).await;
            match &result {
                Ok(manifest) => event!(
                    Level::INFO,
                    snapshot_id = %manifest.snapshot_id,
                    records = manifest.total_records(),
                    "snapshot written"
                ),
                Err(err) => event!(Level::ERROR, error = %err, "snapshot write failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn write_inner<S>(
        &self,
        store: &S,
        entity_types: &[&str],
        handle: &SnapshotHandle,
    ) -> Result<SnapshotManifest>
    where
        S: Store + ?Sized,
    {
        let selected = self.select(entity_types)?;
        let graph = self.registry.graph().subgraph(&selected)?;
        prepare_output(handle.root()).await?;

        let scope = store.read_scope().await?;
        let rows = read_all(self.registry, &*scope, graph.order()).await?;
        drop(scope);

        let keys = self.index_keys(&rows)?;

        let mut entity_sections = Vec::new();
        let mut association_sections = Vec::new();
        for name in graph.order() {
            let entity = self.registry.get(name)?;
            let rows = rows.get(name).map(Vec::as_slice).unwrap_or_default();
            let entry = match entity.kind() {
                EntityKind::Entity => {
                    let records = self.encode_entities(entity, rows, &selected, &keys)?;
                    let entry = self
                        .write_section(handle, SectionKind::Entity, name, &records)
                        .await?;
                    entity_sections.push(entry.clone());
                    entry
                }
                EntityKind::Association => {
                    let records = self.encode_associations(entity, rows, &selected, &keys)?;
                    let entry = self
                        .write_section(handle, SectionKind::Association, name, &records)
                        .await?;
                    association_sections.push(entry.clone());
                    entry
                }
            };
            event!(
                Level::INFO,
                entity_type = %name,
                records = entry.expected_count,
                "section exported"
            );
        }

        let mut manifest = SnapshotManifest {
            format: SNAPSHOT_FORMAT.to_string(),
            schema_version: SCHEMA_VERSION,
            snapshot_id: Uuid::new_v4(),
            created_at: Utc::now(),
            mode: self.options.mode,
            encoding: self.options.encoding,
            entity_types: entity_sections,
            association_types: association_sections,
            content_checksum: String::new(),
        };
        manifest.content_checksum = manifest.compute_content_checksum();
        write_manifest(handle.root(), &manifest).await?;
        Ok(manifest)
    }

    fn select(&self, entity_types: &[&str]) -> Result<BTreeSet<String>> {
        if entity_types.is_empty() {
            return Ok(self.registry.graph().order().iter().cloned().collect());
        }
        entity_types
            .iter()
            .map(|name| self.registry.get(name).map(|t| t.name().to_string()))
            .collect()
    }

    /// Maps source ids to natural keys and rejects duplicate keys.
    fn index_keys(&self, rows: &BTreeMap<String, Vec<StoredRow>>) -> Result<KeyIndex> {
        let mut index = KeyIndex::new();
        for (name, rows) in rows {
            let entity = self.registry.get(name)?;
            if entity.kind() != EntityKind::Entity {
                continue;
            }
            let mut by_id = HashMap::with_capacity(rows.len());
            let mut seen = HashSet::new();
            for row in rows {
                let Some(key) = entity.extract_key(&row.fields)? else {
                    continue;
                };
                if !seen.insert(key.clone()) {
                    return Err(BackupError::NaturalKeyCollision {
                        entity_type: name.clone(),
                        natural_key: key.to_string(),
                    });
                }
                by_id.insert(row.id, key);
            }
            index.insert(name.clone(), by_id);
        }
        Ok(index)
    }

    fn encode_entities(
        &self,
        entity: &EntityType,
        rows: &[StoredRow],
        selected: &BTreeSet<String>,
        keys: &KeyIndex,
    ) -> Result<Vec<EntityRecord>> {
        let own_keys = keys.get(entity.name());
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let natural_key = own_keys
                .and_then(|k| k.get(&row.id))
                .cloned()
                .ok_or_else(|| {
                    BackupError::ConstraintViolation(format!(
                        "'{}' row {} has no natural key",
                        entity.name(),
                        row.id
                    ))
                })?;
            // Seeds exist in every target; references to them still encode
            // by natural key.
            if entity.is_seed(&natural_key) {
                continue;
            }
            for part in natural_key.parts() {
                self.ensure_representable(entity, row.id, "natural key", part)?;
            }

            let mut foreign_keys = BTreeMap::new();
            for fk in entity.foreign_keys() {
                if let Some(reference) = self.encode_reference(entity, fk, row, selected, keys)? {
                    foreign_keys.insert(fk.field.clone(), reference);
                }
            }

            records.push(EntityRecord {
                natural_key,
                source_id: entity.preserves_ids().then_some(row.id),
                fields: self.plain_fields(entity, row)?,
                foreign_keys,
            });
        }
        Ok(records)
    }

    fn encode_associations(
        &self,
        entity: &EntityType,
        rows: &[StoredRow],
        selected: &BTreeSet<String>,
        keys: &KeyIndex,
    ) -> Result<Vec<AssociationRecord>> {
        let [from, to] = entity.foreign_keys() else {
            return Err(BackupError::Configuration(format!(
                "association '{}' must declare exactly two references",
                entity.name()
            )));
        };

        let endpoint = |fk: &ForeignKeyField, row: &StoredRow| -> Result<Option<NaturalKey>> {
            Ok(match self.encode_reference(entity, fk, row, selected, keys)? {
                Some(ForeignKeyRef::Resolved { natural_key, .. }) => Some(natural_key),
                _ => None,
            })
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(AssociationRecord {
                from_type: from.target.clone(),
                from_natural_key: endpoint(from, row)?,
                to_type: to.target.clone(),
                to_natural_key: endpoint(to, row)?,
                fields: self.plain_fields(entity, row)?,
            });
        }
        Ok(records)
    }

    /// Row fields minus the surrogate id and foreign keys.
    fn plain_fields(&self, entity: &EntityType, row: &StoredRow) -> Result<FieldMap> {
        let mut fields = FieldMap::new();
        for (name, value) in &row.fields {
            if name.as_str() == "id" || entity.foreign_key(name).is_some() {
                continue;
            }
            self.ensure_representable(entity, row.id, name, value)?;
            fields.insert(name.clone(), value.clone());
        }
        Ok(fields)
    }

    fn ensure_representable(
        &self,
        entity: &EntityType,
        id: LocalId,
        field: &str,
        value: &Value,
    ) -> Result<()> {
        if self.options.encoding.can_represent(value) {
            return Ok(());
        }
        Err(BackupError::TypeMismatch(format!(
            "'{}' row {} {}: {} cannot be encoded as {}",
            entity.name(),
            id,
            field,
            value,
            self.options.encoding.extension()
        )))
    }

    /// `None` when the field holds NULL.
    fn encode_reference(
        &self,
        entity: &EntityType,
        fk: &ForeignKeyField,
        row: &StoredRow,
        selected: &BTreeSet<String>,
        keys: &KeyIndex,
    ) -> Result<Option<ForeignKeyRef>> {
        let id = match row.get(&fk.field) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Integer(id)) => *id,
            Some(other) => {
                return Err(BackupError::TypeMismatch(format!(
                    "'{}.{}' must hold a row id, got {}",
                    entity.name(),
                    fk.field,
                    other.type_name()
                )));
            }
        };

        if !selected.contains(&fk.target) {
            return match self.options.mode {
                ExportMode::Strict => Err(BackupError::MissingDependency {
                    entity_type: entity.name().to_string(),
                    field: fk.field.clone(),
                    target: fk.target.clone(),
                }),
                ExportMode::Permissive => Ok(Some(ForeignKeyRef::unresolved(
                    &fk.target,
                    "target type not exported",
                ))),
            };
        }

        match keys.get(&fk.target).and_then(|k| k.get(&id)) {
            Some(key) => Ok(Some(ForeignKeyRef::resolved(&fk.target, key.clone()))),
            None => {
                event!(
                    Level::WARN,
                    entity_type = %entity.name(),
                    field = %fk.field,
                    "dangling reference exported as unresolved"
                );
                Ok(Some(ForeignKeyRef::unresolved(
                    &fk.target,
                    "referenced row missing in source",
                )))
            }
        }
    }

    async fn write_section<T: Serialize>(
        &self,
        handle: &SnapshotHandle,
        kind: SectionKind,
        name: &str,
        records: &[T],
    ) -> Result<SectionEntry> {
        let bytes = self.options.encoding.encode(records)?;
        let path = handle.section_path(kind, name, self.options.encoding);
        fs::write(&path, &bytes).await?;
        Ok(SectionEntry {
            name: name.to_string(),
            expected_count: records.len(),
            checksum: sha256_hex(&bytes),
        })
    }
}

async fn read_all(
    registry: &EntityRegistry,
    scope: &dyn RecordSource,
    order: &[String],
) -> Result<BTreeMap<String, Vec<StoredRow>>> {
    let mut rows = BTreeMap::new();
    for name in order {
        let entity = registry.get(name)?;
        rows.insert(name.clone(), scope.scan(entity.table()).await?);
    }
    Ok(rows)
}

async fn prepare_output(root: &Path) -> Result<()> {
    if fs::try_exists(root.join(MANIFEST_FILE)).await? {
        return Err(BackupError::Configuration(format!(
            "'{}' already holds a snapshot",
            root.display()
        )));
    }
    for kind in [SectionKind::Entity, SectionKind::Association] {
        fs::create_dir_all(root.join(kind.dir())).await?;
    }
    Ok(())
}

/// Stages the manifest in a temp file inside `root` and renames it into place.
async fn write_manifest(root: &Path, manifest: &SnapshotManifest) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    let root: PathBuf = root.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut staged = tempfile::Builder::new()
            .prefix(".manifest")
            .tempfile_in(&root)?;
        staged.write_all(&bytes)?;
        staged.as_file().sync_all()?;
        staged
            .persist(root.join(MANIFEST_FILE))
            .map_err(|err| BackupError::IoError(err.to_string()))?;
        Ok(())
    })
    .await
    .map_err(|err| BackupError::IoError(err.to_string()))?
}
