pub mod cache;
pub mod completeness;
pub mod engine;
pub mod policy;
pub mod report;
pub mod sequence;

pub use cache::IdMappingCache;
pub use completeness::{finalize, validate_completeness};
pub use engine::RestoreEngine;
pub use policy::{CancellationToken, ConflictPolicy, RestoreOptions};
pub use report::{
    EntityOutcome, ReasonCode, RecordError, RestoreProgress, RestoreReport, RestoreWarning,
};
pub use sequence::reconcile_sequences;
