use tracing::{Level, event};

use super::RestoreWarning;
use crate::core::Result;
use crate::schema::EntityType;
use crate::storage::StoreTransaction;

/// Moves each table's auto-increment counter past the ids inserted
/// explicitly, so the next generated id cannot collide.
///
/// A failed reset does not touch restored data and only becomes a warning.
pub async fn reconcile_sequences(
    tx: &dyn StoreTransaction,
    entity_types: &[&EntityType],
) -> Result<Vec<RestoreWarning>> {
    let mut warnings = Vec::new();
    for entity in entity_types {
        let next = tx.max_id(entity.table()).await?.map_or(1, |max| max + 1);
        match tx.reset_sequence(entity.table(), next).await {
            Ok(()) => event!(
                Level::DEBUG,
                entity_type = %entity.name(),
                next,
                "sequence reset"
            ),
            Err(err) => {
                event!(
                    Level::WARN,
                    entity_type = %entity.name(),
                    table = %entity.table(),
                    error = %err,
                    "sequence reset failed"
                );
                warnings.push(RestoreWarning::SequenceResetFailure {
                    entity_type: entity.name().to_string(),
                    table: entity.table().to_string(),
                    detail: err.to_string(),
                });
            }
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FieldMap, Value};
    use crate::storage::{MemoryStore, Store};

    #[tokio::test]
    async fn test_reset_past_explicit_ids() {
        let store = MemoryStore::new();
        store.create_table("user").await.unwrap();
        store.create_table_without_sequence("audit").await.unwrap();
        let user = EntityType::new("user").text_field("name").natural_key(&["name"]);
        let audit = EntityType::new("audit").text_field("code").natural_key(&["code"]);

        let tx = store.begin().await.unwrap();
        let mut fields = FieldMap::new();
        fields.insert("name".into(), Value::from("alice"));
        tx.insert("user", Some(41), fields).await.unwrap();

        let warnings = reconcile_sequences(&*tx, &[&user, &audit]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.next_sequence_value("user").await.unwrap(), Some(42));
        assert_eq!(warnings.len(), 1);
        assert!(matches!(
            &warnings[0],
            RestoreWarning::SequenceResetFailure { table, .. } if table == "audit"
        ));
    }
}
