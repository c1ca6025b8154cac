use crate::core::{BackupError, DataType, FieldDef, FieldMap, NaturalKey, Result, Value};
use crate::restore::ConflictPolicy;

/// A foreign-key field: the row stores the referenced record's local id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyField {
    pub field: String,
    pub target: String,
    pub nullable: bool,
    /// May be inserted as NULL and patched after the primary pass.
    pub deferrable: bool,
}

/// Whether a type carries its own natural key or is pure join data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Entity,
    Association,
}

/// Static declaration of one category of record.
///
/// Declared once at startup and handed to `EntityRegistry::builder()`;
/// immutable afterwards.
///
/// ```
/// use natkey_backup::schema::EntityType;
///
/// let document = EntityType::new("document")
///     .text_field("number")
///     .text_field("title")
///     .natural_key(&["number"])
///     .reference("author_id", "user");
///
/// assert_eq!(document.table(), "document");
/// assert_eq!(document.foreign_keys().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct EntityType {
    name: String,
    table: String,
    fields: Vec<FieldDef>,
    natural_key: Option<Vec<String>>,
    foreign_keys: Vec<ForeignKeyField>,
    seed_keys: Vec<NaturalKey>,
    preserve_ids: bool,
    conflict_policy: Option<ConflictPolicy>,
}

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            fields: Vec::new(),
            natural_key: None,
            foreign_keys: Vec::new(),
            seed_keys: Vec::new(),
            preserve_ids: false,
            conflict_policy: None,
        }
    }

    /// Store table backing this type; defaults to the type name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Shorthand for a non-nullable text field.
    pub fn text_field(self, name: &str) -> Self {
        self.field(FieldDef::new(name, DataType::Text).not_null())
    }

    pub fn natural_key(mut self, fields: &[&str]) -> Self {
        self.natural_key = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Required reference to `target`.
    pub fn reference(mut self, field: &str, target: &str) -> Self {
        self.foreign_keys.push(ForeignKeyField {
            field: field.to_string(),
            target: target.to_string(),
            nullable: false,
            deferrable: false,
        });
        self
    }

    pub fn optional_reference(mut self, field: &str, target: &str) -> Self {
        self.foreign_keys.push(ForeignKeyField {
            field: field.to_string(),
            target: target.to_string(),
            nullable: true,
            deferrable: false,
        });
        self
    }

    /// Nullable reference that may be patched in a second pass when it
    /// closes a dependency cycle.
    pub fn deferrable_reference(mut self, field: &str, target: &str) -> Self {
        self.foreign_keys.push(ForeignKeyField {
            field: field.to_string(),
            target: target.to_string(),
            nullable: true,
            deferrable: true,
        });
        self
    }

    /// Bootstrap record expected in a freshly reset target.
    pub fn seed(mut self, key: impl Into<NaturalKey>) -> Self {
        self.seed_keys.push(key.into());
        self
    }

    /// Carry source ids through snapshots and insert with them when free.
    pub fn preserve_ids(mut self) -> Self {
        self.preserve_ids = true;
        self
    }

    /// Pin the conflict policy for this type regardless of the restore call.
    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn natural_key_fields(&self) -> Option<&[String]> {
        self.natural_key.as_deref()
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyField] {
        &self.foreign_keys
    }

    pub fn foreign_key(&self, field: &str) -> Option<&ForeignKeyField> {
        self.foreign_keys.iter().find(|fk| fk.field == field)
    }

    pub fn seed_keys(&self) -> &[NaturalKey] {
        &self.seed_keys
    }

    pub fn is_seed(&self, key: &NaturalKey) -> bool {
        self.seed_keys.contains(key)
    }

    pub fn preserves_ids(&self) -> bool {
        self.preserve_ids
    }

    pub fn policy_override(&self) -> Option<ConflictPolicy> {
        self.conflict_policy
    }

    pub fn kind(&self) -> EntityKind {
        if self.natural_key.is_some() {
            EntityKind::Entity
        } else {
            EntityKind::Association
        }
    }

    pub fn key_arity(&self) -> Option<usize> {
        self.natural_key.as_ref().map(Vec::len)
    }

    /// Natural key of a record, or `None` for association types.
    pub fn extract_key(&self, fields: &FieldMap) -> Result<Option<NaturalKey>> {
        let Some(key_fields) = &self.natural_key else {
            return Ok(None);
        };

        let mut parts = Vec::with_capacity(key_fields.len());
        for name in key_fields {
            match fields.get(name) {
                Some(value) if !value.is_null() => parts.push(value.clone()),
                _ => {
                    return Err(BackupError::ConstraintViolation(format!(
                        "'{}' record has no value for natural-key field '{}'",
                        self.name, name
                    )));
                }
            }
        }
        Ok(Some(NaturalKey::new(parts)))
    }

    /// Field/value pairs that locate a record by natural key in a store.
    pub fn key_criteria(&self, key: &NaturalKey) -> Result<Vec<(String, Value)>> {
        let key_fields = self.natural_key.as_ref().ok_or_else(|| {
            BackupError::Configuration(format!("'{}' has no natural key", self.name))
        })?;
        if key_fields.len() != key.len() {
            return Err(BackupError::TypeMismatch(format!(
                "'{}' natural key has {} parts, got {}",
                self.name,
                key_fields.len(),
                key.len()
            )));
        }
        Ok(key_fields
            .iter()
            .cloned()
            .zip(key.parts().iter().cloned())
            .collect())
    }

    /// Checks declaration-level invariants that do not need other types.
    pub(crate) fn validate_declaration(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for name in self
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.foreign_keys.iter().map(|fk| fk.field.as_str()))
        {
            if name == "id" {
                return Err(BackupError::Configuration(format!(
                    "'{}' declares field 'id', which is reserved for the surrogate key",
                    self.name
                )));
            }
            if !seen.insert(name) {
                return Err(BackupError::Configuration(format!(
                    "'{}' declares field '{}' twice",
                    self.name, name
                )));
            }
        }

        if let Some(key_fields) = &self.natural_key {
            if key_fields.is_empty() {
                return Err(BackupError::Configuration(format!(
                    "'{}' declares an empty natural key",
                    self.name
                )));
            }
            for name in key_fields {
                if self.foreign_key(name).is_some() {
                    return Err(BackupError::Configuration(format!(
                        "'{}' natural key uses foreign-key field '{}'",
                        self.name, name
                    )));
                }
                match self.get_field(name) {
                    Some(field) if !field.nullable => {}
                    Some(_) => {
                        return Err(BackupError::Configuration(format!(
                            "'{}' natural-key field '{}' must be NOT NULL",
                            self.name, name
                        )));
                    }
                    None => {
                        return Err(BackupError::Configuration(format!(
                            "'{}' natural key names unknown field '{}'",
                            self.name, name
                        )));
                    }
                }
            }
            for seed in &self.seed_keys {
                if seed.len() != key_fields.len() {
                    return Err(BackupError::Configuration(format!(
                        "'{}' seed key {} does not match the natural key arity",
                        self.name, seed
                    )));
                }
            }
        } else {
            if self.foreign_keys.len() != 2 {
                return Err(BackupError::Configuration(format!(
                    "'{}' has no natural key, so it must be an association \
                     with exactly two references (found {})",
                    self.name,
                    self.foreign_keys.len()
                )));
            }
            if !self.seed_keys.is_empty() {
                return Err(BackupError::Configuration(format!(
                    "association '{}' cannot declare seed keys",
                    self.name
                )));
            }
            if self.preserve_ids {
                return Err(BackupError::Configuration(format!(
                    "association '{}' cannot preserve ids",
                    self.name
                )));
            }
        }

        for fk in &self.foreign_keys {
            if fk.deferrable && !fk.nullable {
                return Err(BackupError::Configuration(format!(
                    "deferrable reference '{}.{}' must be nullable",
                    self.name, fk.field
                )));
            }
        }

        Ok(())
    }
}
