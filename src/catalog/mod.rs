//! Configuration records and the host catalog boundary

pub mod config_record;
pub mod host;
pub mod store;

pub use config_record::{ConfigParams, PathmanConfig};
pub use host::{BoundaryDescriptor, ChildRelation, HostCatalog, InMemoryCatalog, RelationMeta};
pub use store::{ConfigStore, FileConfigStore, MemoryConfigStore};
pub use crate::partition::PartType;
