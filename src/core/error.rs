use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("Unsupported snapshot schema version {found} (engine supports up to {supported})")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },

    #[error("Cyclic dependency without a deferrable edge: {}", .0.join(" -> "))]
    CyclicDependencyUnresolved(Vec<String>),

    #[error("Natural key collision in '{entity_type}': {natural_key} appears more than once")]
    NaturalKeyCollision {
        entity_type: String,
        natural_key: String,
    },

    #[error("Conflict policy violation in '{entity_type}' for {natural_key}: {detail}")]
    ConflictPolicyViolation {
        entity_type: String,
        natural_key: String,
        detail: String,
    },

    #[error("'{entity_type}.{field}' references '{target}', which is not part of the export")]
    MissingDependency {
        entity_type: String,
        field: String,
        target: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Row {1} not found in table '{0}'")]
    RowNotFound(String, i64),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl BackupError {
    /// Errors raised while the registry is being built, before any data moves.
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::CyclicDependencyUnresolved(_)
        )
    }

    /// Whether the error describes the snapshot container rather than the stores.
    pub fn is_snapshot_error(&self) -> bool {
        matches!(
            self,
            Self::SnapshotCorrupt(_) | Self::UnsupportedSchemaVersion { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl<T> From<std::sync::PoisonError<T>> for BackupError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BackupError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BackupError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
