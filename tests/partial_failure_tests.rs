//! Per-record failures: the restore finishes and the report names them.

use natkey_backup::snapshot::ForeignKeyRef;
use natkey_backup::{
    BackupEngine, ConflictPolicy, EntityRegistry, ExportOptions, MemoryStore, NaturalKey,
    ReasonCode, RestoreOptions, SnapshotHandle, Value,
};
use tempfile::TempDir;


use fixtures::*;

async fn export_with_dave(registry: &EntityRegistry, dir: &TempDir) -> SnapshotHandle {
    let store = MemoryStore::for_registry(registry).await;
    let alice = add_user(&store, "alice").await;
    let dave = add_user(&store, "dave").await;
    add_document(&store, "DOC-1", alice).await;
    add_document(&store, "DOC-2", dave).await;
    add_document(&store, "DOC-3", alice).await;

    BackupEngine::new(registry.clone(), store)
        .create_snapshot(&[], dir.path(), ExportOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_unresolvable_author_skips_only_that_document() {
    let registry = document_registry();
    let dir = TempDir::new().unwrap();
    let snapshot = export_with_dave(&registry, &dir).await;

    // dave's record goes missing from an otherwise valid snapshot.
    rewrite_entities(dir.path(), "user", |records| {
        records.retain(|r| r.natural_key != NaturalKey::from("dave"));
    });

    let target = BackupEngine::new(registry.clone(), reset_target(&registry).await);
    let report = target
        .restore(&snapshot, &RestoreOptions::new(ConflictPolicy::StrictEmpty))
        .await
        .unwrap();

    let documents = report.outcome("document").unwrap();
    assert_eq!(documents.inserted, 2);
    assert_eq!(documents.failed, 1);

    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].reason, ReasonCode::NaturalKeyResolutionFailure);
    assert_eq!(errors[0].natural_key, Some(NaturalKey::from("dave")));
    assert_eq!(errors[0].record_key, "DOC-2");
    assert_eq!(errors[0].field.as_deref(), Some("author_id"));
    assert!(errors[0].record_skipped);

    // The shortfall carries the failure, not a policy skip.
    assert_eq!(report.shortfall_for("document"), 1);
    assert!(report.warnings.iter().any(|w| matches!(
        w,
        natkey_backup::RestoreWarning::Shortfall {
            entity_type,
            failed: 1,
            skipped_by_policy: 0,
            ..
        } if entity_type == "document"
    )));

    let authors = authors(target.store()).await;
    assert_eq!(authors.len(), 2);
    assert!(!authors.contains_key("DOC-2"));
}

#[tokio::test]
async fn test_author_present_in_target_resolves_without_export() {
    let registry = document_registry();
    let dir = TempDir::new().unwrap();
    let snapshot = export_with_dave(&registry, &dir).await;
    rewrite_entities(dir.path(), "user", |records| {
        records.retain(|r| r.natural_key != NaturalKey::from("dave"));
    });

    // The target already knows dave, so the lookup fallback finds him.
    let store = reset_target(&registry).await;
    let dave = add_user(&store, "dave").await;
    let target = BackupEngine::new(registry.clone(), store);
    let report = target
        .restore(&snapshot, &RestoreOptions::new(ConflictPolicy::StrictEmpty))
        .await
        .unwrap();

    assert!(!report.has_errors());
    let authors = column(target.store(), "document", "number", "author_id").await;
    assert_eq!(authors["DOC-2"], Value::Integer(dave));
}

#[tokio::test]
async fn test_unresolved_markers_from_permissive_export() {
    let registry = document_registry();
    let source = MemoryStore::for_registry(&registry).await;
    let alice = add_user(&source, "alice").await;
    let bob = add_user(&source, "bob").await;
    let doc = add_document(&source, "DOC-1", alice).await;
    source
        .update_row("document", doc, fields(&[("reviewer_id", Value::Integer(bob))]))
        .await
        .unwrap();
    let source = BackupEngine::new(registry.clone(), source);

    let dir = TempDir::new().unwrap();
    let snapshot = source
        .create_snapshot(&["document"], dir.path(), ExportOptions::permissive())
        .await
        .unwrap();
    let manifest = source.read_manifest(&snapshot).await.unwrap();
    assert_eq!(manifest.entity_types.len(), 1);

    // Turn the required author reference back into a real key so only the
    // optional reviewer stays unresolved.
    rewrite_entities(dir.path(), "document", |records| {
        assert!(matches!(
            records[0].foreign_keys["reviewer_id"],
            ForeignKeyRef::Unresolved { .. }
        ));
        records[0].foreign_keys.insert(
            "author_id".to_string(),
            ForeignKeyRef::resolved("user", NaturalKey::from("admin")),
        );
    });

    let target = BackupEngine::new(registry.clone(), reset_target(&registry).await);
    let report = target
        .restore(&snapshot, &RestoreOptions::new(ConflictPolicy::StrictEmpty))
        .await
        .unwrap();

    let documents = report.outcome("document").unwrap();
    assert_eq!(documents.inserted, 1);
    assert_eq!(documents.failed, 0);
    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].reason, ReasonCode::UnresolvedReference);
    assert_eq!(errors[0].field.as_deref(), Some("reviewer_id"));
    assert!(!errors[0].record_skipped);
    assert!(report.is_complete());

    let reviewers = column(target.store(), "document", "number", "reviewer_id").await;
    assert_eq!(reviewers["DOC-1"], Value::Null);
}

#[tokio::test]
async fn test_unresolved_required_reference_skips_record() {
    let registry = document_registry();
    let source = MemoryStore::for_registry(&registry).await;
    let alice = add_user(&source, "alice").await;
    add_document(&source, "DOC-1", alice).await;
    let source = BackupEngine::new(registry.clone(), source);

    let dir = TempDir::new().unwrap();
    let snapshot = source
        .create_snapshot(&["document"], dir.path(), ExportOptions::permissive())
        .await
        .unwrap();

    let target = BackupEngine::new(registry.clone(), reset_target(&registry).await);
    let report = target
        .restore(&snapshot, &RestoreOptions::new(ConflictPolicy::StrictEmpty))
        .await
        .unwrap();

    let documents = report.outcome("document").unwrap();
    assert_eq!(documents.failed, 1);
    assert_eq!(documents.errors[0].reason, ReasonCode::UnresolvedReference);
    assert_eq!(report.shortfall_for("document"), 1);
    assert_eq!(target.store().row_count("document").await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_field_value_is_rejected_per_record() {
    let registry = document_registry();
    let dir = TempDir::new().unwrap();
    let snapshot = export_with_dave(&registry, &dir).await;
    rewrite_entities(dir.path(), "document", |records| {
        records[0]
            .fields
            .insert("title".to_string(), Value::Integer(42));
    });

    let target = BackupEngine::new(registry.clone(), reset_target(&registry).await);
    let report = target
        .restore(&snapshot, &RestoreOptions::new(ConflictPolicy::StrictEmpty))
        .await
        .unwrap();

    let documents = report.outcome("document").unwrap();
    assert_eq!(documents.inserted, 2);
    assert_eq!(documents.errors[0].reason, ReasonCode::StoreRejected);
    assert_eq!(documents.errors[0].record_key, "DOC-1");
}
