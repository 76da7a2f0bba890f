use serde::{Deserialize, Serialize};

use crate::core::{DatabaseId, RelationId, TransactionId};
use crate::partition::PartType;

const fn default_true() -> bool {
    true
}

/// Per-relation switches stored next to the configuration record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigParams {
    /// Include the parent table itself in pruned plans
    #[serde(default)]
    pub enable_parent: bool,
    /// Create partitions for out-of-range inserts
    #[serde(default = "default_true")]
    pub auto: bool,
    /// Allow delegating creation to the background worker pool
    #[serde(default = "default_true")]
    pub spawn_using_bgw: bool,
}

impl Default for ConfigParams {
    fn default() -> Self {
        Self {
            enable_parent: false,
            auto: true,
            spawn_using_bgw: true,
        }
    }
}

/// Persisted partitioning configuration of one relation.
///
/// The cache is a derived view of these records and the host catalog; it can
/// always be rebuilt from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathmanConfig {
    /// Sequence id assigned by the store
    pub id: u64,
    pub database: DatabaseId,
    pub partrel: RelationId,
    pub attname: String,
    pub parttype: PartType,
    /// Textual interval, only for range partitioning
    pub range_interval: Option<String>,
    /// Transaction that partitioned the relation
    pub created_by: TransactionId,
    #[serde(default)]
    pub params: ConfigParams,
}

impl PathmanConfig {
    #[must_use]
    pub fn range(
        database: DatabaseId,
        partrel: RelationId,
        attname: impl Into<String>,
        range_interval: Option<String>,
        created_by: TransactionId,
    ) -> Self {
        Self {
            id: 0,
            database,
            partrel,
            attname: attname.into(),
            parttype: PartType::Range,
            range_interval,
            created_by,
            params: ConfigParams::default(),
        }
    }

    #[must_use]
    pub fn hash(
        database: DatabaseId,
        partrel: RelationId,
        attname: impl Into<String>,
        created_by: TransactionId,
    ) -> Self {
        Self {
            id: 0,
            database,
            partrel,
            attname: attname.into(),
            parttype: PartType::Hash,
            range_interval: None,
            created_by,
            params: ConfigParams::default(),
        }
    }
}
