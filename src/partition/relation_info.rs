use std::sync::Arc;

use crate::catalog::ConfigParams;
use crate::core::{DataType, DatabaseId, PathmanError, RelationId, Result, TransactionId, Value};
use super::compare::ValueComparator;
use super::hash::HashDirectory;
use super::interval::RangeInterval;
use super::range::{RangeDirectory, SearchResult};
use super::PartType;

#[derive(Debug, Clone)]
pub enum Directory {
    Range(RangeDirectory),
    Hash(HashDirectory),
}

/// Cached view of one partitioned relation: its configuration plus the directory
/// of its partitions.
///
/// Instances are immutable. Structural edits build a new instance and publish it
/// in the cache, so a reader always works on one consistent snapshot.
#[derive(Debug, Clone)]
pub struct PartRelationInfo {
    pub database: DatabaseId,
    pub parent: RelationId,
    pub column: String,
    /// Position of the partition column in the parent's rows
    pub column_index: usize,
    pub data_type: DataType,
    pub interval: Option<RangeInterval>,
    pub params: ConfigParams,
    /// Transaction that partitioned the relation
    pub partitioned_by: TransactionId,
    directory: Directory,
    cmp: Arc<dyn ValueComparator>,
}

impl PartRelationInfo {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        database: DatabaseId,
        parent: RelationId,
        column: String,
        column_index: usize,
        data_type: DataType,
        interval: Option<RangeInterval>,
        params: ConfigParams,
        partitioned_by: TransactionId,
        directory: Directory,
        cmp: Arc<dyn ValueComparator>,
    ) -> Self {
        Self {
            database,
            parent,
            column,
            column_index,
            data_type,
            interval,
            params,
            partitioned_by,
            directory,
            cmp,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PartType {
        match self.directory {
            Directory::Range(_) => PartType::Range,
            Directory::Hash(_) => PartType::Hash,
        }
    }

    #[must_use]
    pub const fn directory(&self) -> &Directory {
        &self.directory
    }

    #[must_use]
    pub const fn range(&self) -> Option<&RangeDirectory> {
        match &self.directory {
            Directory::Range(r) => Some(r),
            Directory::Hash(_) => None,
        }
    }

    #[must_use]
    pub const fn hash(&self) -> Option<&HashDirectory> {
        match &self.directory {
            Directory::Hash(h) => Some(h),
            Directory::Range(_) => None,
        }
    }

    #[must_use]
    pub fn comparator(&self) -> &dyn ValueComparator {
        self.cmp.as_ref()
    }

    #[must_use]
    pub fn children_count(&self) -> usize {
        match &self.directory {
            Directory::Range(r) => r.len(),
            Directory::Hash(h) => h.len(),
        }
    }

    /// Partition at directory position `index`
    #[must_use]
    pub fn child(&self, index: usize) -> Option<RelationId> {
        match &self.directory {
            Directory::Range(r) => r.get(index).map(|e| e.partition),
            Directory::Hash(h) => h.partition(index),
        }
    }

    #[must_use]
    pub fn children(&self) -> Vec<RelationId> {
        (0..self.children_count()).filter_map(|i| self.child(i)).collect()
    }

    /// Checks a key against the partition column and converts it to canonical form
    pub fn key_of(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Err(PathmanError::InvalidRequest(format!(
                "partition key \"{}\" of relation {} cannot be NULL",
                self.column, self.parent
            )));
        }
        self.data_type.coerce(value)
    }

    /// Locates `value` in the directory. Hash directories always report `Found(bucket)`.
    pub fn locate(&self, value: &Value) -> Result<SearchResult> {
        let key = self.key_of(value)?;
        match &self.directory {
            Directory::Range(r) => r.locate(&key, self.comparator()),
            Directory::Hash(h) => Ok(SearchResult::Found(h.bucket_for(&key))),
        }
    }

    /// Copy of this entry with a replaced range directory
    #[must_use]
    pub fn with_range_directory(&self, directory: RangeDirectory) -> Self {
        Self {
            directory: Directory::Range(directory),
            ..self.clone()
        }
    }
}
