pub mod error;
pub mod types;
pub mod value;

pub use error::{BackupError, Result};
pub use types::{FieldDef, FieldMap, LocalId, NaturalKey, StoredRow};
pub use value::{DataType, Value};
