use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ConflictPolicy;
use crate::core::NaturalKey;

/// Why a record (or one of its fields) did not make it into the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    /// A referenced natural key is neither restored nor present in the target.
    NaturalKeyResolutionFailure,
    /// The snapshot itself marked the reference `unresolved`.
    UnresolvedReference,
    /// The store refused the row (type or constraint check).
    StoreRejected,
}

/// One recoverable, per-record problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    /// The key that could not be resolved, or the record's own key when the
    /// store rejected it.
    pub natural_key: Option<NaturalKey>,
    /// The record this error belongs to.
    pub record_key: String,
    pub field: Option<String>,
    pub reason: ReasonCode,
    pub detail: String,
    /// False when the record was kept with the field left NULL.
    pub record_skipped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityOutcome {
    pub entity_type: String,
    pub association: bool,
    pub expected: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Skipped by the conflict policy.
    pub skipped: usize,
    /// Dropped because of a record error.
    pub failed: usize,
    /// Deferred references filled in after the primary pass.
    pub patched: usize,
    /// Row count seen by an audit, which replaces `inserted + updated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<usize>,
    pub errors: Vec<RecordError>,
}

impl EntityOutcome {
    pub fn new(entity_type: impl Into<String>, association: bool) -> Self {
        Self {
            entity_type: entity_type.into(),
            association,
            ..Self::default()
        }
    }

    pub fn restored(&self) -> usize {
        self.observed.unwrap_or(self.inserted + self.updated)
    }

    pub(crate) fn record_error(&mut self, error: RecordError) {
        if error.record_skipped {
            self.failed += 1;
        }
        self.errors.push(error);
    }
}

/// Recoverable conditions that are not tied to one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RestoreWarning {
    #[serde(rename_all = "camelCase")]
    Shortfall {
        entity_type: String,
        expected: usize,
        restored: usize,
        shortfall: usize,
        skipped_by_policy: usize,
        failed: usize,
    },
    #[serde(rename_all = "camelCase")]
    SequenceResetFailure {
        entity_type: String,
        table: String,
        detail: String,
    },
    /// Verification failed and `ignore_checksum` was set.
    ChecksumIgnored { issues: Vec<String> },
    #[serde(rename_all = "camelCase")]
    CountMismatch {
        entity_type: String,
        expected: usize,
        actual: usize,
    },
}

/// Outcome of a restore or an audit.
///
/// A report is only returned when nothing fatal happened. Records may
/// still have been dropped: check [`RestoreReport::has_errors`] and
/// [`RestoreReport::is_complete`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub snapshot_id: Uuid,
    /// `None` for an audit.
    pub policy: Option<ConflictPolicy>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Restore order.
    pub entities: Vec<EntityOutcome>,
    pub warnings: Vec<RestoreWarning>,
}

impl RestoreReport {
    pub fn outcome(&self, entity_type: &str) -> Option<&EntityOutcome> {
        self.entities.iter().find(|o| o.entity_type == entity_type)
    }

    pub fn errors(&self) -> impl Iterator<Item = &RecordError> {
        self.entities.iter().flat_map(|o| o.errors.iter())
    }

    pub fn error_count(&self) -> usize {
        self.entities.iter().map(|o| o.errors.len()).sum()
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    /// Missing rows for `entity_type`, 0 when none.
    pub fn shortfall_for(&self, entity_type: &str) -> usize {
        self.warnings
            .iter()
            .find_map(|w| match w {
                RestoreWarning::Shortfall {
                    entity_type: name,
                    shortfall,
                    ..
                } if name == entity_type => Some(*shortfall),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// No type fell short of its manifest count.
    pub fn is_complete(&self) -> bool {
        !self
            .warnings
            .iter()
            .any(|w| matches!(w, RestoreWarning::Shortfall { .. }))
    }
}

/// Report under construction, handed to the completeness finalizer.
#[derive(Debug, Clone)]
pub struct RestoreProgress {
    pub snapshot_id: Uuid,
    pub policy: Option<ConflictPolicy>,
    pub started_at: DateTime<Utc>,
    pub outcomes: BTreeMap<String, EntityOutcome>,
    /// Types in the order they were processed.
    pub order: Vec<String>,
    pub warnings: Vec<RestoreWarning>,
}

impl RestoreProgress {
    pub fn new(snapshot_id: Uuid, policy: Option<ConflictPolicy>) -> Self {
        Self {
            snapshot_id,
            policy,
            started_at: Utc::now(),
            outcomes: BTreeMap::new(),
            order: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: EntityOutcome) {
        if !self.outcomes.contains_key(&outcome.entity_type) {
            self.order.push(outcome.entity_type.clone());
        }
        self.outcomes.insert(outcome.entity_type.clone(), outcome);
    }

    pub fn outcome_mut(&mut self, entity_type: &str) -> Option<&mut EntityOutcome> {
        self.outcomes.get_mut(entity_type)
    }

    pub fn warn(&mut self, warning: RestoreWarning) {
        self.warnings.push(warning);
    }
}
