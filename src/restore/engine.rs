//! Phased restore of a snapshot into a store.
//!
//! 1. validate the container and load it into memory
//! 2. primary restore of keyed types, level by level
//! 3. patch deferred references
//! 4. restore associations
//! 5. reconcile sequences
//! 6. completeness
//!
//! Phases 2 to 5 run inside one store transaction. Anything fatal rolls it
//! back; per-record problems only land in the report.

use std::collections::{BTreeSet, HashMap, HashSet};

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{Instrument, Level, event, info_span};

use super::completeness::finalize;
use super::sequence::reconcile_sequences;
use super::{
    ConflictPolicy, EntityOutcome, IdMappingCache, ReasonCode, RecordError, RestoreOptions,
    RestoreProgress, RestoreReport, RestoreWarning,
};
use crate::core::{BackupError, FieldMap, LocalId, NaturalKey, Result, Value};
use crate::schema::{DependencyGraph, EntityKind, EntityRegistry, EntityType, ForeignKeyField};
use crate::snapshot::{
    AssociationRecord, EntityRecord, ForeignKeyRef, IntegrityIssue, RecordBatch, SectionKind,
    SnapshotHandle, SnapshotManifest, SnapshotReader,
};
use crate::storage::{Store, StoreTransaction};

pub struct RestoreEngine<'a, S: Store + ?Sized> {
    registry: &'a EntityRegistry,
    store: &'a S,
}

#[derive(Debug, Default)]
struct SnapshotData {
    entities: HashMap<String, Vec<EntityRecord>>,
    associations: HashMap<String, Vec<AssociationRecord>>,
}

impl SnapshotData {
    fn entities(&self, name: &str) -> &[EntityRecord] {
        self.entities.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    fn associations(&self, name: &str) -> &[AssociationRecord] {
        self.associations
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// A deferred reference waiting for phase 3.
#[derive(Debug)]
struct PendingPatch {
    entity: String,
    id: LocalId,
    record_key: NaturalKey,
    field: String,
    reference: ForeignKeyRef,
}

enum Resolution {
    Found(LocalId),
    Missing {
        reason: ReasonCode,
        natural_key: Option<NaturalKey>,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Inserted,
    Updated,
    Skipped,
}

impl<'a, S: Store + ?Sized> RestoreEngine<'a, S> {
    pub fn new(registry: &'a EntityRegistry, store: &'a S) -> Self {
        Self { registry, store }
    }

    /// Loads the snapshot at `handle` into the store inside one transaction.
    ///
    /// Per-record problems land in the report; anything else rolls the
    /// transaction back and is returned as the error.
    pub async fn restore(
        &self,
        handle: &SnapshotHandle,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let span = info_span!(
            "restore",
            snapshot = %handle.root().display(),
            policy = %options.policy
        );
        async move {
            let result = self.run(handle, options).await;
            match &result {
                Ok(report) => event!(
                    Level::INFO,
                    snapshot_id = %report.snapshot_id,
                    errors = report.error_count(),
                    complete = report.is_complete(),
                    "restore finished"
                ),
                Err(err) => event!(Level::ERROR, error = %err, "restore failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        handle: &SnapshotHandle,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let (manifest, data, mut progress) = self
            .validate(handle, options)
            .instrument(info_span!("restore.validate"))
            .await?;
        ensure_active(options)?;

        let names: BTreeSet<String> = manifest
            .sections()
            .map(|(_, entry)| entry.name.clone())
            .collect();
        let graph = self.registry.graph().subgraph(&names)?;

        let tx = self.store.begin().await?;
        let run = RestoreRun {
            registry: self.registry,
            graph,
            tx: &*tx,
            cache: IdMappingCache::new(),
            options,
        };

        match run.execute(&data, &mut progress).await {
            Ok(()) => tx.commit().await?,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    event!(Level::ERROR, error = %rollback_err, "restore rollback failed");
                }
                return Err(err);
            }
        }

        Ok(finalize(&manifest, progress))
    }

    /// Phase 1. Nothing has been written when this fails.
    async fn validate(
        &self,
        handle: &SnapshotHandle,
        options: &RestoreOptions,
    ) -> Result<(SnapshotManifest, SnapshotData, RestoreProgress)> {
        let reader = SnapshotReader::open(handle).await?;
        let manifest = reader.manifest().clone();
        let mut progress = RestoreProgress::new(manifest.snapshot_id, Some(options.policy));

        let issues = reader.verify_report().await?;
        if !issues.is_empty() {
            let described: Vec<String> = issues.iter().map(ToString::to_string).collect();
            let readable = issues.iter().all(IntegrityIssue::is_readable);
            if !options.ignore_checksum || !readable {
                return Err(BackupError::SnapshotCorrupt(described.join("; ")));
            }
            event!(
                Level::ERROR,
                snapshot_id = %manifest.snapshot_id,
                issues = %described.join("; "),
                "SNAPSHOT FAILED VERIFICATION; restoring anyway because ignore_checksum is set"
            );
            for issue in &issues {
                if let IntegrityIssue::CountMismatch {
                    section,
                    expected,
                    actual,
                } = issue
                {
                    progress.warn(RestoreWarning::CountMismatch {
                        entity_type: section.clone(),
                        expected: *expected,
                        actual: *actual,
                    });
                }
            }
            progress.warn(RestoreWarning::ChecksumIgnored { issues: described });
        }

        for (kind, entry) in manifest.sections() {
            let entity = self.registry.get(&entry.name).map_err(|_| {
                BackupError::Configuration(format!(
                    "snapshot section '{}' has no registered entity type",
                    entry.name
                ))
            })?;
            let declared = match kind {
                SectionKind::Entity => EntityKind::Entity,
                SectionKind::Association => EntityKind::Association,
            };
            if entity.kind() != declared {
                return Err(BackupError::SnapshotCorrupt(format!(
                    "section '{}' is stored as {:?} but registered as {:?}",
                    entry.name,
                    declared,
                    entity.kind()
                )));
            }
        }

        let batches: Vec<RecordBatch> = reader.batches().try_collect().await?;
        let mut data = SnapshotData::default();
        for batch in batches {
            match batch {
                RecordBatch::Entities {
                    entity_type,
                    records,
                } => {
                    check_keys(self.registry.get(&entity_type)?, &records)?;
                    data.entities.insert(entity_type, records);
                }
                RecordBatch::Associations {
                    entity_type,
                    records,
                } => {
                    data.associations.insert(entity_type, records);
                }
            }
        }

        Ok((manifest, data, progress))
    }
}

/// Rejects snapshot sections with malformed or duplicate natural keys.
fn check_keys(entity: &EntityType, records: &[EntityRecord]) -> Result<()> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if entity.key_arity() != Some(record.natural_key.len()) {
            return Err(BackupError::SnapshotCorrupt(format!(
                "'{}' record {} does not match the natural key arity",
                entity.name(),
                record.natural_key
            )));
        }
        if !seen.insert(&record.natural_key) {
            return Err(BackupError::NaturalKeyCollision {
                entity_type: entity.name().to_string(),
                natural_key: record.natural_key.to_string(),
            });
        }
    }
    Ok(())
}

fn ensure_active(options: &RestoreOptions) -> Result<()> {
    if options.cancel.is_cancelled() {
        event!(Level::WARN, "restore cancelled");
        return Err(BackupError::Cancelled);
    }
    Ok(())
}

/// Store errors that reject one record rather than the whole restore.
fn store_rejection(err: BackupError) -> Result<String> {
    match err {
        BackupError::ConstraintViolation(detail) | BackupError::TypeMismatch(detail) => Ok(detail),
        other => Err(other),
    }
}

fn validate_fields(entity: &EntityType, fields: &FieldMap) -> std::result::Result<(), String> {
    for def in entity.fields() {
        let value = fields.get(&def.name).unwrap_or(&Value::Null);
        def.validate(value).map_err(|err| err.to_string())?;
    }
    Ok(())
}

/// State shared by every phase of one restore.
struct RestoreRun<'r> {
    registry: &'r EntityRegistry,
    graph: DependencyGraph,
    tx: &'r dyn StoreTransaction,
    cache: IdMappingCache,
    options: &'r RestoreOptions,
}

impl<'r> RestoreRun<'r> {
    async fn execute(&self, data: &SnapshotData, progress: &mut RestoreProgress) -> Result<()> {
        let patches = self
            .primary(data, progress)
            .instrument(info_span!("restore.primary"))
            .await?;
        ensure_active(self.options)?;

        self.patch_deferred(patches, progress)
            .instrument(info_span!("restore.deferred"))
            .await?;
        ensure_active(self.options)?;

        self.associations(data, progress)
            .instrument(info_span!("restore.associations"))
            .await?;
        ensure_active(self.options)?;

        self.sequences(data, progress)
            .instrument(info_span!("restore.sequences"))
            .await?;
        ensure_active(self.options)
    }

    /// Phase 2. Types in one level have no edges between them and run
    /// concurrently.
    async fn primary(
        &self,
        data: &SnapshotData,
        progress: &mut RestoreProgress,
    ) -> Result<Vec<PendingPatch>> {
        let mut patches = Vec::new();
        for level in self.graph.levels() {
            let mut types = Vec::with_capacity(level.len());
            for name in level {
                let entity = self.registry.get(name)?;
                if entity.kind() == EntityKind::Entity {
                    types.push(entity);
                }
            }

            let results: Vec<Result<(EntityOutcome, Vec<PendingPatch>)>> = stream::iter(types)
                .map(|entity| self.restore_entities(entity, data.entities(entity.name())))
                .buffered(self.options.max_parallel_types.max(1))
                .collect()
                .await;
            for result in results {
                let (outcome, pending) = result?;
                progress.record(outcome);
                patches.extend(pending);
            }
        }
        Ok(patches)
    }

    async fn restore_entities(
        &self,
        entity: &EntityType,
        records: &[EntityRecord],
    ) -> Result<(EntityOutcome, Vec<PendingPatch>)> {
        ensure_active(self.options)?;
        let policy = entity.policy_override().unwrap_or(self.options.policy);
        let mut outcome = EntityOutcome::new(entity.name(), false);
        let mut patches = Vec::new();

        'records: for record in records {
            let mut fields = record.fields.clone();
            fields.remove("id");
            let mut deferred = Vec::new();

            for fk in entity.foreign_keys() {
                let reference = record.foreign_keys.get(&fk.field);
                if self.graph.is_deferred(entity.name(), &fk.field) {
                    fields.insert(fk.field.clone(), Value::Null);
                    if let Some(reference) = reference {
                        deferred.push((fk.field.clone(), reference.clone()));
                    }
                    continue;
                }

                let value = match reference {
                    None if fk.nullable => Value::Null,
                    None => {
                        self.skip_record(
                            &mut outcome,
                            entity,
                            &record.natural_key,
                            RecordError {
                                natural_key: None,
                                record_key: record.natural_key.to_string(),
                                field: Some(fk.field.clone()),
                                reason: ReasonCode::UnresolvedReference,
                                detail: "required reference missing from snapshot".to_string(),
                                record_skipped: true,
                            },
                        );
                        continue 'records;
                    }
                    Some(reference) => match self.resolve(fk, reference).await? {
                        Resolution::Found(id) => Value::Integer(id),
                        Resolution::Missing {
                            reason,
                            natural_key,
                            detail,
                        } => {
                            // Only an explicit unresolved marker on a nullable
                            // field keeps the record.
                            let record_skipped =
                                !fk.nullable || reason == ReasonCode::NaturalKeyResolutionFailure;
                            self.skip_record(
                                &mut outcome,
                                entity,
                                &record.natural_key,
                                RecordError {
                                    natural_key,
                                    record_key: record.natural_key.to_string(),
                                    field: Some(fk.field.clone()),
                                    reason,
                                    detail,
                                    record_skipped,
                                },
                            );
                            if record_skipped {
                                continue 'records;
                            }
                            Value::Null
                        }
                    },
                };
                fields.insert(fk.field.clone(), value);
            }

            if let Err(detail) = validate_fields(entity, &fields) {
                self.skip_record(
                    &mut outcome,
                    entity,
                    &record.natural_key,
                    rejected(&record.natural_key, detail),
                );
                continue;
            }

            let Some((id, applied)) = self
                .apply_entity(entity, policy, record, fields, &mut outcome)
                .await?
            else {
                continue;
            };
            self.cache.insert(entity.name(), record.natural_key.clone(), id)?;

            if applied != Applied::Skipped {
                patches.extend(deferred.into_iter().map(|(field, reference)| PendingPatch {
                    entity: entity.name().to_string(),
                    id,
                    record_key: record.natural_key.clone(),
                    field,
                    reference,
                }));
            }
        }

        event!(
            Level::INFO,
            entity_type = %entity.name(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "entity type restored"
        );
        Ok((outcome, patches))
    }

    /// Applies the conflict policy to one keyed record. `None` means the
    /// store rejected it and the error is already recorded.
    async fn apply_entity(
        &self,
        entity: &EntityType,
        policy: ConflictPolicy,
        record: &EntityRecord,
        fields: FieldMap,
        outcome: &mut EntityOutcome,
    ) -> Result<Option<(LocalId, Applied)>> {
        let existing = self
            .registry
            .lookup(entity.name(), &record.natural_key, self.tx)
            .await?;

        let Some(local) = existing else {
            let id = if entity.preserves_ids() {
                Some(self.explicit_id(entity, record.source_id).await?)
            } else {
                None
            };
            return match self.tx.insert(entity.table(), id, fields).await {
                Ok(id) => {
                    outcome.inserted += 1;
                    Ok(Some((id, Applied::Inserted)))
                }
                Err(err) => {
                    let detail = store_rejection(err)?;
                    self.skip_record(
                        outcome,
                        entity,
                        &record.natural_key,
                        rejected(&record.natural_key, detail),
                    );
                    Ok(None)
                }
            };
        };

        match policy {
            ConflictPolicy::StrictEmpty if entity.is_seed(&record.natural_key) => {
                outcome.skipped += 1;
                Ok(Some((local, Applied::Skipped)))
            }
            ConflictPolicy::StrictEmpty => Err(BackupError::ConflictPolicyViolation {
                entity_type: entity.name().to_string(),
                natural_key: record.natural_key.to_string(),
                detail: "target already holds a non-seed record with this key".to_string(),
            }),
            ConflictPolicy::UpsertByNaturalKey => {
                match self.tx.update(entity.table(), local, fields).await {
                    Ok(()) => {
                        outcome.updated += 1;
                        Ok(Some((local, Applied::Updated)))
                    }
                    Err(err) => {
                        let detail = store_rejection(err)?;
                        self.skip_record(
                            outcome,
                            entity,
                            &record.natural_key,
                            rejected(&record.natural_key, detail),
                        );
                        Ok(None)
                    }
                }
            }
            ConflictPolicy::SkipExisting => {
                outcome.skipped += 1;
                Ok(Some((local, Applied::Skipped)))
            }
        }
    }

    /// The source id when the target has it free, otherwise one past the
    /// table's highest id.
    async fn explicit_id(
        &self,
        entity: &EntityType,
        source_id: Option<LocalId>,
    ) -> Result<LocalId> {
        if let Some(id) = source_id {
            if id > 0 && self.tx.get(entity.table(), id).await?.is_none() {
                return Ok(id);
            }
        }
        Ok(self.tx.max_id(entity.table()).await?.map_or(1, |max| max + 1))
    }

    /// Phase 3.
    async fn patch_deferred(
        &self,
        patches: Vec<PendingPatch>,
        progress: &mut RestoreProgress,
    ) -> Result<()> {
        let mut current: Option<String> = None;
        for patch in patches {
            if current.as_deref() != Some(patch.entity.as_str()) {
                ensure_active(self.options)?;
                current = Some(patch.entity.clone());
            }
            let entity = self.registry.get(&patch.entity)?;
            let fk = entity.foreign_key(&patch.field).ok_or_else(|| {
                BackupError::Configuration(format!(
                    "'{}' has no reference field '{}'",
                    patch.entity, patch.field
                ))
            })?;

            let error = match self.resolve(fk, &patch.reference).await? {
                Resolution::Found(target) => {
                    let mut fields = FieldMap::new();
                    fields.insert(patch.field.clone(), Value::Integer(target));
                    match self.tx.update(entity.table(), patch.id, fields).await {
                        Ok(()) => {
                            if let Some(outcome) = progress.outcome_mut(&patch.entity) {
                                outcome.patched += 1;
                            }
                            continue;
                        }
                        Err(err) => rejected(&patch.record_key, store_rejection(err)?),
                    }
                }
                Resolution::Missing {
                    reason,
                    natural_key,
                    detail,
                } => RecordError {
                    natural_key,
                    record_key: patch.record_key.to_string(),
                    field: Some(patch.field.clone()),
                    reason,
                    detail,
                    record_skipped: false,
                },
            };

            event!(
                Level::DEBUG,
                entity_type = %patch.entity,
                natural_key = %patch.record_key,
                field = %patch.field,
                reason = ?error.reason,
                "deferred reference left NULL"
            );
            if let Some(outcome) = progress.outcome_mut(&patch.entity) {
                outcome.record_error(RecordError {
                    record_skipped: false,
                    field: Some(patch.field.clone()),
                    ..error
                });
            }
        }
        Ok(())
    }

    /// Phase 4.
    async fn associations(
        &self,
        data: &SnapshotData,
        progress: &mut RestoreProgress,
    ) -> Result<()> {
        let mut types = Vec::new();
        for name in self.graph.order() {
            let entity = self.registry.get(name)?;
            if entity.kind() == EntityKind::Association {
                types.push(entity);
            }
        }

        let results: Vec<Result<EntityOutcome>> = stream::iter(types)
            .map(|entity| self.restore_associations(entity, data.associations(entity.name())))
            .buffered(self.options.max_parallel_types.max(1))
            .collect()
            .await;
        for result in results {
            progress.record(result?);
        }
        Ok(())
    }

    async fn restore_associations(
        &self,
        entity: &EntityType,
        records: &[AssociationRecord],
    ) -> Result<EntityOutcome> {
        ensure_active(self.options)?;
        let [from, to] = entity.foreign_keys() else {
            return Err(BackupError::Configuration(format!(
                "association '{}' must declare exactly two references",
                entity.name()
            )));
        };
        let policy = entity.policy_override().unwrap_or(self.options.policy);
        let mut outcome = EntityOutcome::new(entity.name(), true);

        for record in records {
            let record_key = record.describe();
            let ends = [
                (from, &record.from_type, &record.from_natural_key),
                (to, &record.to_type, &record.to_natural_key),
            ];

            let mut ids = Vec::with_capacity(2);
            for (fk, target, key) in ends {
                let resolution = match key {
                    _ if *target != fk.target => Resolution::Missing {
                        reason: ReasonCode::UnresolvedReference,
                        natural_key: key.clone(),
                        detail: format!(
                            "endpoint type '{}' does not match '{}'",
                            target, fk.target
                        ),
                    },
                    None => Resolution::Missing {
                        reason: ReasonCode::UnresolvedReference,
                        natural_key: None,
                        detail: "endpoint exported as unresolved".to_string(),
                    },
                    Some(key) => match self.lookup_key(&fk.target, key).await? {
                        Some(id) => Resolution::Found(id),
                        None => missing_key(&fk.target, key),
                    },
                };
                match resolution {
                    Resolution::Found(id) => ids.push(id),
                    Resolution::Missing {
                        reason,
                        natural_key,
                        detail,
                    } => {
                        outcome.record_error(RecordError {
                            natural_key,
                            record_key: record_key.clone(),
                            field: Some(fk.field.clone()),
                            reason,
                            detail,
                            record_skipped: true,
                        });
                        break;
                    }
                }
            }
            let &[from_id, to_id] = ids.as_slice() else {
                event!(
                    Level::DEBUG,
                    entity_type = %entity.name(),
                    record = %record_key,
                    "association skipped"
                );
                continue;
            };

            let mut fields = record.fields.clone();
            fields.remove("id");
            fields.insert(from.field.clone(), Value::Integer(from_id));
            fields.insert(to.field.clone(), Value::Integer(to_id));
            if let Err(detail) = validate_fields(entity, &fields) {
                outcome.record_error(association_rejected(&record_key, detail));
                continue;
            }

            let criteria = [
                (from.field.clone(), Value::Integer(from_id)),
                (to.field.clone(), Value::Integer(to_id)),
            ];
            let existing = self
                .tx
                .find_by_fields(entity.table(), &criteria)
                .await?
                .into_iter()
                .next();

            let write = match (existing, policy) {
                (None, _) => self
                    .tx
                    .insert(entity.table(), None, fields)
                    .await
                    .map(|_| Applied::Inserted),
                (Some(_), ConflictPolicy::StrictEmpty) if self.touches_seed(record) => {
                    Ok(Applied::Skipped)
                }
                (Some(_), ConflictPolicy::StrictEmpty) => {
                    return Err(BackupError::ConflictPolicyViolation {
                        entity_type: entity.name().to_string(),
                        natural_key: record_key,
                        detail: "target already links these records".to_string(),
                    });
                }
                (Some(row), ConflictPolicy::UpsertByNaturalKey) => self
                    .tx
                    .update(entity.table(), row.id, fields)
                    .await
                    .map(|_| Applied::Updated),
                (Some(_), ConflictPolicy::SkipExisting) => Ok(Applied::Skipped),
            };

            match write {
                Ok(Applied::Inserted) => outcome.inserted += 1,
                Ok(Applied::Updated) => outcome.updated += 1,
                Ok(Applied::Skipped) => outcome.skipped += 1,
                Err(err) => {
                    let detail = store_rejection(err)?;
                    outcome.record_error(association_rejected(&record_key, detail));
                }
            }
        }

        event!(
            Level::INFO,
            entity_type = %entity.name(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "association type restored"
        );
        Ok(outcome)
    }

    fn touches_seed(&self, record: &AssociationRecord) -> bool {
        let seed = |entity: &str, key: &Option<NaturalKey>| {
            key.as_ref()
                .is_some_and(|key| self.registry.is_seed(entity, key))
        };
        seed(&record.from_type, &record.from_natural_key)
            || seed(&record.to_type, &record.to_natural_key)
    }

    /// Phase 5, for every type restored with explicit ids.
    async fn sequences(&self, data: &SnapshotData, progress: &mut RestoreProgress) -> Result<()> {
        let mut types = Vec::new();
        for name in self.graph.order() {
            let entity = self.registry.get(name)?;
            if entity.preserves_ids() && data.entities.contains_key(name) {
                types.push(entity);
            }
        }
        for warning in reconcile_sequences(self.tx, &types).await? {
            progress.warn(warning);
        }
        Ok(())
    }

    async fn resolve(&self, fk: &ForeignKeyField, reference: &ForeignKeyRef) -> Result<Resolution> {
        match reference {
            ForeignKeyRef::Unresolved { reason, .. } => Ok(Resolution::Missing {
                reason: ReasonCode::UnresolvedReference,
                natural_key: None,
                detail: format!("exported as unresolved: {}", reason),
            }),
            ForeignKeyRef::Resolved {
                target,
                natural_key,
            } if *target != fk.target => Ok(Resolution::Missing {
                reason: ReasonCode::UnresolvedReference,
                natural_key: Some(natural_key.clone()),
                detail: format!(
                    "reference points at '{}' but '{}' targets '{}'",
                    target, fk.field, fk.target
                ),
            }),
            ForeignKeyRef::Resolved {
                target,
                natural_key,
            } => Ok(match self.lookup_key(target, natural_key).await? {
                Some(id) => Resolution::Found(id),
                None => missing_key(target, natural_key),
            }),
        }
    }

    /// Cache first, then the target itself (covers records that were never
    /// exported, such as seeds). Target hits are cached.
    async fn lookup_key(&self, entity: &str, key: &NaturalKey) -> Result<Option<LocalId>> {
        if let Some(id) = self.cache.get(entity, key)? {
            return Ok(Some(id));
        }
        let Ok(target) = self.registry.get(entity) else {
            return Ok(None);
        };
        if target.key_arity() != Some(key.len()) {
            return Ok(None);
        }
        let found = self.registry.lookup(entity, key, self.tx).await?;
        if let Some(id) = found {
            self.cache.insert(entity, key.clone(), id)?;
        }
        Ok(found)
    }

    fn skip_record(
        &self,
        outcome: &mut EntityOutcome,
        entity: &EntityType,
        natural_key: &NaturalKey,
        error: RecordError,
    ) {
        event!(
            Level::DEBUG,
            entity_type = %entity.name(),
            natural_key = %natural_key,
            reason = ?error.reason,
            kept = !error.record_skipped,
            detail = %error.detail,
            "record error"
        );
        outcome.record_error(error);
    }
}

fn missing_key(entity: &str, key: &NaturalKey) -> Resolution {
    Resolution::Missing {
        reason: ReasonCode::NaturalKeyResolutionFailure,
        natural_key: Some(key.clone()),
        detail: format!("no '{}' with natural key {}", entity, key),
    }
}

fn rejected(key: &NaturalKey, detail: String) -> RecordError {
    RecordError {
        natural_key: Some(key.clone()),
        record_key: key.to_string(),
        field: None,
        reason: ReasonCode::StoreRejected,
        detail,
        record_skipped: true,
    }
}

fn association_rejected(record_key: &str, detail: String) -> RecordError {
    RecordError {
        natural_key: None,
        record_key: record_key.to_string(),
        field: None,
        reason: ReasonCode::StoreRejected,
        detail,
        record_skipped: true,
    }
}
