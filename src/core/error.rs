use thiserror::Error;

use super::{DataType, RelationId};

pub type Result<T, E = PathmanError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum PathmanError {
    #[error("Type mismatch: expected {expected:?}, found {found}")]
    TypeMismatch { expected: DataType, found: String },
    #[error("Could not serialize access: {0}")]
    SerializationConflict(String),
    #[error("Lock timeout on relation {relation} ({mode})")]
    LockTimeout { relation: RelationId, mode: &'static str },
    #[error("Could not create partition: {0}")]
    CreationFailure(String),
    #[error("Partitioning configuration of relation {relation} is inconsistent: {reason}")]
    ConfigurationInconsistent { relation: RelationId, reason: String },
    #[error("Relation {0} is not partitioned")]
    NotPartitioned(RelationId),
    #[error("Relation {0} not found")]
    RelationNotFound(RelationId),
    #[error("Relation {0} is already partitioned")]
    AlreadyPartitioned(RelationId),
    #[error("Column '{0}' not found")]
    ColumnNotFound(String),
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Binary serialization error: {0}")]
    Serialization(String),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl PathmanError {
    pub fn type_mismatch(expected: &DataType, found: &super::Value) -> Self {
        Self::TypeMismatch {
            expected: expected.clone(),
            found: found.type_name().to_string(),
        }
    }

    pub fn inconsistent(relation: RelationId, reason: impl Into<String>) -> Self {
        Self::ConfigurationInconsistent {
            relation,
            reason: reason.into(),
        }
    }
}
