pub mod entity;
pub mod graph;
pub mod registry;

pub use entity::{EntityKind, EntityType, ForeignKeyField};
pub use graph::{DependencyEdge, DependencyGraph};
pub use registry::{EntityRegistry, EntityRegistryBuilder};
