// ============================================================================
// natkey_backup
// ============================================================================
//
// Backup and restore of relational data through natural keys: records are
// exported with their references encoded as business identifiers, and
// restored into a target whose surrogate ids may differ entirely.

pub mod core;
pub mod facade;
pub mod restore;
pub mod schema;
pub mod snapshot;
pub mod storage;

pub use crate::core::{
    BackupError, DataType, FieldDef, FieldMap, LocalId, NaturalKey, Result, Value,
};
pub use crate::facade::BackupEngine;
pub use crate::restore::{
    CancellationToken, ConflictPolicy, ReasonCode, RestoreEngine, RestoreOptions, RestoreReport,
    RestoreWarning,
};
pub use crate::schema::{EntityRegistry, EntityType};
pub use crate::snapshot::{
    ExportMode, ExportOptions, SectionEncoding, SnapshotHandle, SnapshotManifest,
};
pub use crate::storage::{MemoryStore, Store};
