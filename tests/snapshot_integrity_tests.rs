//! Damaged or foreign containers never reach the target store.

use natkey_backup::snapshot::SnapshotReader;
use natkey_backup::{
    BackupEngine, BackupError, ConflictPolicy, EntityRegistry, EntityType, ExportOptions,
    MemoryStore, RestoreOptions, RestoreWarning, SnapshotHandle,
};
use tempfile::TempDir;


use fixtures::*;

async fn export(registry: &EntityRegistry, dir: &TempDir) -> SnapshotHandle {
    let store = MemoryStore::for_registry(registry).await;
    let alice = add_user(&store, "alice").await;
    add_user(&store, "bob").await;
    add_document(&store, "DOC-1", alice).await;

    BackupEngine::new(registry.clone(), store)
        .create_snapshot(&[], dir.path(), ExportOptions::default())
        .await
        .unwrap()
}

/// Flips a username without touching the manifest.
fn tamper_user_section(dir: &TempDir) {
    let path = dir.path().join("entities").join("user.json");
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replace("bob", "eve")).unwrap();
}

#[tokio::test]
async fn test_tampered_section_is_fatal_before_any_write() {
    let registry = document_registry();
    let dir = TempDir::new().unwrap();
    let snapshot = export(&registry, &dir).await;
    tamper_user_section(&dir);

    let target = BackupEngine::new(registry.clone(), reset_target(&registry).await);
    assert!(!target.verify(&snapshot).await.unwrap());

    let err = target
        .restore(&snapshot, &RestoreOptions::new(ConflictPolicy::StrictEmpty))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::SnapshotCorrupt(_)));
    assert!(err.is_snapshot_error());

    assert_eq!(target.store().row_count("user").await.unwrap(), 1);
    assert_eq!(target.store().row_count("document").await.unwrap(), 0);
}

#[tokio::test]
async fn test_ignore_checksum_restores_with_warning() {
    let registry = document_registry();
    let dir = TempDir::new().unwrap();
    let snapshot = export(&registry, &dir).await;
    tamper_user_section(&dir);

    let target = BackupEngine::new(registry.clone(), reset_target(&registry).await);
    let report = target
        .restore(
            &snapshot,
            &RestoreOptions::new(ConflictPolicy::StrictEmpty).with_ignore_checksum(true),
        )
        .await
        .unwrap();

    assert!(report
        .warnings
        .iter()
        .any(|w| matches!(w, RestoreWarning::ChecksumIgnored { issues } if !issues.is_empty())));
    let names = column(target.store(), "user", "username", "username").await;
    assert!(names.contains_key("eve"));
    assert!(!names.contains_key("bob"));
}

#[tokio::test]
async fn test_missing_section_is_fatal_even_when_ignoring_checksums() {
    let registry = document_registry();
    let dir = TempDir::new().unwrap();
    let snapshot = export(&registry, &dir).await;
    std::fs::remove_file(dir.path().join("entities").join("document.json")).unwrap();

    let target = BackupEngine::new(registry.clone(), reset_target(&registry).await);
    let err = target
        .restore(
            &snapshot,
            &RestoreOptions::new(ConflictPolicy::StrictEmpty).with_ignore_checksum(true),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::SnapshotCorrupt(_)));
    assert_eq!(target.store().row_count("user").await.unwrap(), 1);
}

#[tokio::test]
async fn test_newer_schema_version_is_rejected() {
    let registry = document_registry();
    let dir = TempDir::new().unwrap();
    let snapshot = export(&registry, &dir).await;

    let mut manifest = read_manifest(dir.path());
    manifest.schema_version = natkey_backup::snapshot::SCHEMA_VERSION + 1;
    write_manifest(dir.path(), &manifest);

    let err = SnapshotReader::open(&snapshot).await.unwrap_err();
    assert!(matches!(
        err,
        BackupError::UnsupportedSchemaVersion { found: 2, supported: 1 }
    ));

    let target = BackupEngine::new(registry.clone(), reset_target(&registry).await);
    let err = target
        .restore(&snapshot, &RestoreOptions::new(ConflictPolicy::StrictEmpty))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::UnsupportedSchemaVersion { .. }));
    assert_eq!(target.store().row_count("user").await.unwrap(), 1);
}

#[tokio::test]
async fn test_section_unknown_to_registry_is_rejected() {
    let registry = document_registry();
    let dir = TempDir::new().unwrap();
    let snapshot = export(&registry, &dir).await;

    // A target that only knows about users.
    let narrow = EntityRegistry::builder()
        .entity(
            EntityType::new("user")
                .text_field("username")
                .natural_key(&["username"]),
        )
        .build()
        .unwrap();
    let store = MemoryStore::for_registry(&narrow).await;
    let target = BackupEngine::new(narrow, store);

    let err = target
        .restore(&snapshot, &RestoreOptions::new(ConflictPolicy::StrictEmpty))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Configuration(_)));
    assert_eq!(target.store().row_count("user").await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_manifest_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let err = SnapshotReader::open(&SnapshotHandle::new(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::SnapshotCorrupt(_)));
}

#[tokio::test]
async fn test_reader_streams_sections_in_manifest_order() {
    use futures::TryStreamExt;

    let registry = document_registry();
    let dir = TempDir::new().unwrap();
    let snapshot = export(&registry, &dir).await;

    let reader = SnapshotReader::open(&snapshot).await.unwrap();
    assert!(reader.verify().await.unwrap());
    let batches: Vec<_> = reader.batches().try_collect().await.unwrap();
    let names: Vec<&str> = batches.iter().map(|b| b.entity_type()).collect();
    let expected: Vec<&str> = reader
        .manifest()
        .sections()
        .map(|(_, entry)| entry.name.as_str())
        .collect();
    assert_eq!(names, expected);
    assert_eq!(reader.read_entities("user").await.unwrap().len(), 2);
}
