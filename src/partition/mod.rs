//! Partition directories and the per-relation partitioning view
//!
//! Pure data and search algorithms: nothing here takes locks or talks to the host.

pub mod compare;
pub mod hash;
pub mod interval;
pub mod range;
pub mod relation_info;

pub use compare::{compare_values, TypeComparator, ValueComparator};
pub use hash::{hash_value, make_hash, HashBucket, HashDirectory};
pub use interval::RangeInterval;
pub use range::{OutOfRange, RangeDirectory, RangeEntry, SearchResult};
pub use relation_info::{Directory, PartRelationInfo};

use serde::{Deserialize, Serialize};

/// Partitioning scheme of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartType {
    /// Fixed number of buckets, `hash(value) mod n`
    Hash,
    /// Ordered `[lower, upper)` ranges, optionally extended on demand
    Range,
}

impl PartType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hash => "hash",
            Self::Range => "range",
        }
    }
}
