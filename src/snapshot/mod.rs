pub mod format;
pub mod reader;
pub mod writer;

pub use format::{
    AssociationRecord, EntityRecord, ExportMode, ForeignKeyRef, SCHEMA_VERSION, SectionEncoding,
    SectionEntry, SectionKind, SnapshotHandle, SnapshotManifest,
};
pub use reader::{IntegrityIssue, RecordBatch, SnapshotReader};
pub use writer::{ExportOptions, SnapshotWriter};
