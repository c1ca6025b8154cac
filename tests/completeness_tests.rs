//! Post-hoc audit of a target against a manifest.

use natkey_backup::{
    BackupEngine, ConflictPolicy, ExportOptions, MemoryStore, RestoreOptions, RestoreWarning,
};
use tempfile::TempDir;


use fixtures::*;

#[tokio::test]
async fn test_audit_reports_per_type_shortfall() {
    let registry = document_registry();
    let source = MemoryStore::for_registry(&registry).await;
    let author = add_user(&source, "user-000").await;
    for i in 1..100 {
        add_user(&source, &format!("user-{:03}", i)).await;
    }
    for i in 0..20 {
        add_document(&source, &format!("DOC-{}", i), author).await;
    }
    let source = BackupEngine::new(registry.clone(), source);

    let dir = TempDir::new().unwrap();
    let snapshot = source
        .create_snapshot(&[], dir.path(), ExportOptions::default())
        .await
        .unwrap();
    let manifest = source.read_manifest(&snapshot).await.unwrap();
    assert_eq!(manifest.expected_count("user"), Some(100));

    let target = BackupEngine::new(registry.clone(), reset_target(&registry).await);
    let report = target
        .restore(&snapshot, &RestoreOptions::new(ConflictPolicy::StrictEmpty))
        .await
        .unwrap();
    assert!(report.is_complete());

    let clean = target.validate_completeness(&manifest).await.unwrap();
    assert!(clean.is_complete());
    assert_eq!(clean.policy, None);
    assert_eq!(clean.outcome("user").unwrap().observed, Some(100));

    // Lose three users (none of them authors).
    let victims: Vec<i64> = target
        .store()
        .rows("user")
        .await
        .unwrap()
        .into_iter()
        .filter(|row| {
            let name = row.get("username").unwrap().to_string();
            name == "user-010" || name == "user-020" || name == "user-030"
        })
        .map(|row| row.id)
        .collect();
    assert_eq!(victims.len(), 3);
    for id in victims {
        assert!(target.store().delete_row("user", id).await.unwrap());
    }

    let audit = target.validate_completeness(&manifest).await.unwrap();
    assert!(!audit.is_complete());
    assert_eq!(audit.shortfall_for("user"), 3);
    assert_eq!(audit.shortfall_for("document"), 0);
    assert!(audit.warnings.iter().any(|w| matches!(
        w,
        RestoreWarning::Shortfall {
            entity_type,
            expected: 100,
            restored: 97,
            shortfall: 3,
            ..
        } if entity_type == "user"
    )));
}

#[tokio::test]
async fn test_audit_of_empty_target_covers_every_section() {
    let registry = document_registry();
    let source = MemoryStore::for_registry(&registry).await;
    let alice = add_user(&source, "alice").await;
    let ops = add_group(&source, "ops").await;
    add_membership(&source, alice, ops, "lead").await;
    let source = BackupEngine::new(registry.clone(), source);

    let dir = TempDir::new().unwrap();
    let snapshot = source
        .create_snapshot(&[], dir.path(), ExportOptions::default())
        .await
        .unwrap();
    let manifest = source.read_manifest(&snapshot).await.unwrap();

    let target = BackupEngine::new(registry.clone(), reset_target(&registry).await);
    let audit = target.validate_completeness(&manifest).await.unwrap();

    // The seed admin does not count towards the restored users.
    assert_eq!(audit.shortfall_for("user"), 1);
    assert_eq!(audit.shortfall_for("group"), 1);
    assert_eq!(audit.shortfall_for("membership"), 1);
    assert_eq!(audit.shortfall_for("document"), 0);
    assert_eq!(audit.entities.len(), manifest.sections().count());
}
