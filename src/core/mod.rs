// Module declarations
pub mod error;
pub mod value;
pub mod data_type;
pub mod column;
pub mod row;

// Re-exports for convenience
pub use error::{PathmanError, Result};
pub use value::Value;
pub use data_type::DataType;
pub use column::Column;
pub use row::Row;

/// Host object identifier
pub type Oid = u32;

/// Identifier of a table (parent or partition) in the host catalog
pub type RelationId = Oid;

/// Identifier of a database; relations of different databases never share a directory
pub type DatabaseId = Oid;

/// Transaction identifier, 0 is reserved for bootstrap data
pub type TransactionId = u64;

pub const INVALID_OID: Oid = 0;
