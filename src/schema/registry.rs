use std::collections::BTreeMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use super::{DependencyGraph, EntityKind, EntityType};
use crate::core::{BackupError, FieldMap, LocalId, NaturalKey, Result};
use crate::storage::RecordSource;

lazy_static! {
    // Type names double as section file names.
    static ref ENTITY_NAME: Regex = Regex::new(r"^[a-z][a-z0-9_-]*$").unwrap();
}

/// Statically declared table of entity types and their natural-key rules.
///
/// Built once through [`EntityRegistry::builder`]; every structural problem
/// (unknown reference targets, nullable key fields, malformed association
/// types, unbreakable cycles) fails `build()` so it never surfaces during a
/// restore.
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    types: BTreeMap<String, Arc<EntityType>>,
    graph: DependencyGraph,
}

#[derive(Debug, Default)]
pub struct EntityRegistryBuilder {
    types: Vec<EntityType>,
}

impl EntityRegistryBuilder {
    pub fn entity(mut self, entity: EntityType) -> Self {
        self.types.push(entity);
        self
    }

    pub fn build(self) -> Result<EntityRegistry> {
        let mut types: BTreeMap<String, Arc<EntityType>> = BTreeMap::new();
        let mut tables: BTreeMap<String, String> = BTreeMap::new();

        for entity in self.types {
            if !ENTITY_NAME.is_match(entity.name()) {
                return Err(BackupError::Configuration(format!(
                    "entity type name '{}' must match {}",
                    entity.name(),
                    ENTITY_NAME.as_str()
                )));
            }
            entity.validate_declaration()?;

            if let Some(other) =
                tables.insert(entity.table().to_string(), entity.name().to_string())
            {
                return Err(BackupError::Configuration(format!(
                    "entity types '{}' and '{}' share table '{}'",
                    other,
                    entity.name(),
                    entity.table()
                )));
            }
            let name = entity.name().to_string();
            if types.insert(name.clone(), Arc::new(entity)).is_some() {
                return Err(BackupError::Configuration(format!(
                    "entity type '{}' registered twice",
                    name
                )));
            }
        }

        // References are encoded as natural keys, so every target needs one.
        for entity in types.values() {
            for fk in entity.foreign_keys() {
                let Some(target) = types.get(&fk.target) else {
                    return Err(BackupError::Configuration(format!(
                        "'{}.{}' references unknown entity type '{}'",
                        entity.name(),
                        fk.field,
                        fk.target
                    )));
                };
                if target.kind() != EntityKind::Entity {
                    let role = match entity.kind() {
                        EntityKind::Association => "association endpoint",
                        EntityKind::Entity => "reference",
                    };
                    return Err(BackupError::Configuration(format!(
                        "{} '{}.{}' must reference a type with a natural key",
                        role,
                        entity.name(),
                        fk.field
                    )));
                }
            }
        }

        let graph = DependencyGraph::build(types.values().map(|t| t.as_ref()))?;

        Ok(EntityRegistry { types, graph })
    }
}

impl EntityRegistry {
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Result<&EntityType> {
        self.types
            .get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| BackupError::Configuration(format!("unknown entity type '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// All registered types in dependency order.
    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.graph
            .order()
            .iter()
            .filter_map(|name| self.types.get(name).map(|t| t.as_ref()))
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Natural key of a record of `entity`. `Ok(None)` for association types,
    /// which have none.
    pub fn extract(&self, entity: &str, fields: &FieldMap) -> Result<Option<NaturalKey>> {
        self.get(entity)?.extract_key(fields)
    }

    /// Local id of the record carrying `key` in `source`, if there is one.
    ///
    /// More than one match means the store itself violates natural-key
    /// uniqueness, which is fatal.
    pub async fn lookup<S>(
        &self,
        entity: &str,
        key: &NaturalKey,
        source: &S,
    ) -> Result<Option<LocalId>>
    where
        S: RecordSource + ?Sized,
    {
        let entity = self.get(entity)?;
        let criteria = entity.key_criteria(key)?;
        let rows = source.find_by_fields(entity.table(), &criteria).await?;
        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some(row.id)),
            _ => Err(BackupError::NaturalKeyCollision {
                entity_type: entity.name().to_string(),
                natural_key: key.to_string(),
            }),
        }
    }

    pub fn is_seed(&self, entity: &str, key: &NaturalKey) -> bool {
        self.types
            .get(entity)
            .map(|t| t.is_seed(key))
            .unwrap_or(false)
    }
}
