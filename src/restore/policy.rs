use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// What a restore does when an incoming natural key already exists in the
/// target.
///
/// There is no default: a caller restoring after a reset and a caller
/// restoring over live data want different things, and must say which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Target holds only seed records; any other collision is fatal.
    StrictEmpty,
    /// Existing record is updated in place.
    UpsertByNaturalKey,
    /// Existing record wins; the incoming one is ignored.
    SkipExisting,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictPolicy::StrictEmpty => "StrictEmpty",
            ConflictPolicy::UpsertByNaturalKey => "UpsertByNaturalKey",
            ConflictPolicy::SkipExisting => "SkipExisting",
        };
        f.write_str(name)
    }
}

/// Shared stop signal for a running restore. Checked between entity types
/// and phases; a restore that sees it rolls back.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOptions {
    pub policy: ConflictPolicy,
    /// Proceed even when verification fails. Logged at ERROR.
    pub ignore_checksum: bool,
    /// Upper bound on entity types restored at once within a phase.
    pub max_parallel_types: usize,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl RestoreOptions {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            ignore_checksum: false,
            max_parallel_types: 4,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_ignore_checksum(mut self, ignore: bool) -> Self {
        self.ignore_checksum = ignore;
        self
    }

    pub fn with_max_parallel_types(mut self, max: usize) -> Self {
        self.max_parallel_types = max.max(1);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_serde_skips_token() {
        let options = RestoreOptions::new(ConflictPolicy::SkipExisting).with_max_parallel_types(0);
        assert_eq!(options.max_parallel_types, 1);

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["policy"], "SkipExisting");
        assert!(json.get("cancel").is_none());

        let back: RestoreOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back.policy, ConflictPolicy::SkipExisting);
        assert!(!back.cancel.is_cancelled());
    }

    #[test]
    fn test_cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let options =
            RestoreOptions::new(ConflictPolicy::StrictEmpty).with_cancellation(token.clone());
        assert!(!options.cancel.is_cancelled());
        token.cancel();
        assert!(options.cancel.is_cancelled());
    }
}
