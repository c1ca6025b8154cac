use crate::core::{BackupError, FieldMap, LocalId, Result, StoredRow, Value};
use im::OrdMap;

/// One table of the in-memory store.
///
/// Rows live in a persistent map, so cloning a table (for a transaction's
/// working copy or a read scope) is O(1) and later writes never disturb
/// earlier clones.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    name: String,
    rows: OrdMap<LocalId, FieldMap>,
    /// `None` for tables without an auto-increment counter.
    next_id: Option<LocalId>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: OrdMap::new(),
            next_id: Some(1),
        }
    }

    pub fn without_sequence(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: OrdMap::new(),
            next_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts with an explicit id, or draws the next sequence value.
    ///
    /// Explicit ids do not advance the sequence, exactly like a SQL
    /// `INSERT ... (id, ...)`; a stale counter therefore collides later.
    pub fn insert(&mut self, id: Option<LocalId>, fields: FieldMap) -> Result<LocalId> {
        let id = match id {
            Some(id) => id,
            None => {
                let next = self.next_id.ok_or_else(|| {
                    BackupError::ConstraintViolation(format!(
                        "table '{}' has no sequence; an explicit id is required",
                        self.name
                    ))
                })?;
                self.next_id = Some(next + 1);
                next
            }
        };

        if self.rows.contains_key(&id) {
            return Err(BackupError::ConstraintViolation(format!(
                "duplicate primary key {} in table '{}'",
                id, self.name
            )));
        }
        self.rows.insert(id, fields);
        Ok(id)
    }

    /// Merges `fields` into the row.
    pub fn update(&mut self, id: LocalId, fields: FieldMap) -> Result<()> {
        let row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| BackupError::RowNotFound(self.name.clone(), id))?;
        for (name, value) in fields {
            row.insert(name, value);
        }
        Ok(())
    }

    pub fn delete(&mut self, id: LocalId) -> bool {
        self.rows.remove(&id).is_some()
    }

    pub fn get(&self, id: LocalId) -> Option<StoredRow> {
        self.rows
            .get(&id)
            .map(|fields| StoredRow::new(id, fields.clone()))
    }

    pub fn scan(&self) -> Vec<StoredRow> {
        self.rows
            .iter()
            .map(|(id, fields)| StoredRow::new(*id, fields.clone()))
            .collect()
    }

    pub fn find_by_fields(&self, criteria: &[(String, Value)]) -> Vec<StoredRow> {
        self.rows
            .iter()
            .filter(|(_, fields)| {
                criteria
                    .iter()
                    .all(|(name, value)| fields.get(name).unwrap_or(&Value::Null) == value)
            })
            .map(|(id, fields)| StoredRow::new(*id, fields.clone()))
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn max_id(&self) -> Option<LocalId> {
        self.rows.get_max().map(|(id, _)| *id)
    }

    pub fn next_sequence_value(&self) -> Option<LocalId> {
        self.next_id
    }

    pub fn reset_sequence(&mut self, next: LocalId) -> Result<()> {
        match self.next_id {
            Some(_) => {
                self.next_id = Some(next);
                Ok(())
            }
            None => Err(BackupError::ConstraintViolation(format!(
                "table '{}' has no sequence to reset",
                self.name
            ))),
        }
    }
}
