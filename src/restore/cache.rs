use std::collections::HashMap;
use std::sync::RwLock;

use crate::core::{BackupError, LocalId, NaturalKey, Result};

/// `(entity type, natural key) -> local id`, built during one restore.
///
/// Entries are only ever added. Types restored concurrently share one cache;
/// the lock is never held across an await.
#[derive(Debug, Default)]
pub struct IdMappingCache {
    entries: RwLock<HashMap<(String, NaturalKey), LocalId>>,
}

impl IdMappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a mapping. Re-recording the same id is a no-op; a different
    /// id for a known key is a collision.
    pub fn insert(&self, entity: &str, key: NaturalKey, id: LocalId) -> Result<()> {
        let mut entries = self.entries.write()?;
        match entries.get(&(entity.to_string(), key.clone())) {
            Some(existing) if *existing == id => Ok(()),
            Some(_) => Err(BackupError::NaturalKeyCollision {
                entity_type: entity.to_string(),
                natural_key: key.to_string(),
            }),
            None => {
                entries.insert((entity.to_string(), key), id);
                Ok(())
            }
        }
    }

    pub fn get(&self, entity: &str, key: &NaturalKey) -> Result<Option<LocalId>> {
        let entries = self.entries.read()?;
        Ok(entries.get(&(entity.to_string(), key.clone())).copied())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
