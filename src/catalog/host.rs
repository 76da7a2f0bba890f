//! Host catalog boundary: the tables that exist and how partitions are
//! materialized as real tables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{Column, DatabaseId, PathmanError, RelationId, Result, Row, TransactionId, Value};
use crate::partition::HashBucket;

/// Boundary constraint of one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoundaryDescriptor {
    /// `[lower, upper)`, `None` for an open end
    Range { lower: Option<Value>, upper: Option<Value> },
    Hash(HashBucket),
}

impl std::fmt::Display for BoundaryDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Range { lower, upper } => {
                let lo = lower.as_ref().map_or_else(|| "-infinity".to_string(), ToString::to_string);
                let hi = upper.as_ref().map_or_else(|| "+infinity".to_string(), ToString::to_string);
                write!(f, "[{lo}, {hi})")
            }
            Self::Hash(b) => write!(f, "hash {} of {}", b.bucket, b.buckets),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationMeta {
    pub id: RelationId,
    pub database: DatabaseId,
    pub name: String,
    pub columns: Vec<Column>,
    /// Set for partitions
    pub parent: Option<RelationId>,
    pub bound: Option<BoundaryDescriptor>,
    pub created_by: TransactionId,
}

impl RelationMeta {
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// A partition as listed by the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRelation {
    pub relid: RelationId,
    pub bound: BoundaryDescriptor,
    pub created_by: TransactionId,
}

/// Catalog operations the partitioning core needs from the host
pub trait HostCatalog: Send + Sync {
    fn relation(&self, relid: RelationId) -> Result<Option<RelationMeta>>;

    /// Partitions attached to `parent`, in creation order
    fn children(&self, parent: RelationId) -> Result<Vec<ChildRelation>>;

    /// Creates a child table of `parent` carrying the boundary constraint
    fn create_partition(
        &self,
        parent: RelationId,
        bound: BoundaryDescriptor,
        creator: TransactionId,
    ) -> Result<RelationId>;

    fn drop_relation(&self, relid: RelationId) -> Result<()>;

    /// Turns a partition into an ordinary table, dropping its boundary constraint
    fn detach_partition(&self, relid: RelationId) -> Result<()>;
}

/// Catalog kept in memory; used by the shell and the tests.
#[derive(Debug)]
pub struct InMemoryCatalog {
    relations: RwLock<HashMap<RelationId, RelationMeta>>,
    rows: RwLock<HashMap<RelationId, Vec<Row>>>,
    next_oid: AtomicU32,
    fail_creations_after: AtomicUsize,
    create_delay: RwLock<Option<Duration>>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCatalog {
    /// First oid handed out; lower ids are left to the host's system objects
    pub const FIRST_OID: RelationId = 16384;

    #[must_use]
    pub fn new() -> Self {
        Self {
            relations: RwLock::new(HashMap::new()),
            rows: RwLock::new(HashMap::new()),
            next_oid: AtomicU32::new(Self::FIRST_OID),
            fail_creations_after: AtomicUsize::new(usize::MAX),
            create_delay: RwLock::new(None),
        }
    }

    /// Creates an ordinary table
    pub fn create_table(&self, database: DatabaseId, name: &str, columns: Vec<Column>) -> Result<RelationId> {
        let mut relations = self.relations.write();
        if relations.values().any(|r| r.database == database && r.name == name) {
            return Err(PathmanError::InvalidRequest(format!("relation \"{name}\" already exists")));
        }
        let id = self.next_oid.fetch_add(1, Ordering::SeqCst);
        relations.insert(
            id,
            RelationMeta {
                id,
                database,
                name: name.to_string(),
                columns,
                parent: None,
                bound: None,
                created_by: 0,
            },
        );
        Ok(id)
    }

    #[must_use]
    pub fn find_by_name(&self, database: DatabaseId, name: &str) -> Option<RelationId> {
        self.relations
            .read()
            .values()
            .find(|r| r.database == database && r.name == name)
            .map(|r| r.id)
    }

    /// Lets the next `n` partition creations succeed and fails every later one
    pub fn fail_creations_after(&self, n: usize) {
        self.fail_creations_after.store(n, Ordering::SeqCst);
    }

    /// Slows every partition creation down, widening race windows in tests
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.write() = delay;
    }

    pub fn insert_row(&self, relid: RelationId, row: Row) -> Result<()> {
        if !self.relations.read().contains_key(&relid) {
            return Err(PathmanError::RelationNotFound(relid));
        }
        self.rows.write().entry(relid).or_default().push(row);
        Ok(())
    }

    #[must_use]
    pub fn row_count(&self, relid: RelationId) -> usize {
        self.rows.read().get(&relid).map_or(0, Vec::len)
    }
}

impl HostCatalog for InMemoryCatalog {
    fn relation(&self, relid: RelationId) -> Result<Option<RelationMeta>> {
        Ok(self.relations.read().get(&relid).cloned())
    }

    fn children(&self, parent: RelationId) -> Result<Vec<ChildRelation>> {
        let relations = self.relations.read();
        let mut children: Vec<_> = relations
            .values()
            .filter(|r| r.parent == Some(parent))
            .filter_map(|r| {
                r.bound.clone().map(|bound| ChildRelation {
                    relid: r.id,
                    bound,
                    created_by: r.created_by,
                })
            })
            .collect();
        children.sort_by_key(|c| c.relid);
        Ok(children)
    }

    fn create_partition(
        &self,
        parent: RelationId,
        bound: BoundaryDescriptor,
        creator: TransactionId,
    ) -> Result<RelationId> {
        if let Some(delay) = *self.create_delay.read() {
            std::thread::sleep(delay);
        }

        let budget = self.fail_creations_after.load(Ordering::SeqCst);
        if budget == 0 {
            warn!(parent, %bound, "injected partition creation failure");
            return Err(PathmanError::CreationFailure(format!(
                "could not create partition {bound} of relation {parent}"
            )));
        }
        if budget != usize::MAX {
            self.fail_creations_after.store(budget - 1, Ordering::SeqCst);
        }

        let mut relations = self.relations.write();
        let meta = relations.get(&parent).ok_or(PathmanError::RelationNotFound(parent))?;
        let siblings = relations.values().filter(|r| r.parent == Some(parent)).count();
        let id = self.next_oid.fetch_add(1, Ordering::SeqCst);
        let child = RelationMeta {
            id,
            database: meta.database,
            name: format!("{}_{}", meta.name, siblings + 1),
            columns: meta.columns.clone(),
            parent: Some(parent),
            bound: Some(bound),
            created_by: creator,
        };
        debug!(parent, partition = id, name = %child.name, "created partition");
        relations.insert(id, child);
        Ok(id)
    }

    fn drop_relation(&self, relid: RelationId) -> Result<()> {
        self.relations
            .write()
            .remove(&relid)
            .ok_or(PathmanError::RelationNotFound(relid))?;
        self.rows.write().remove(&relid);
        Ok(())
    }

    fn detach_partition(&self, relid: RelationId) -> Result<()> {
        let mut relations = self.relations.write();
        let rel = relations.get_mut(&relid).ok_or(PathmanError::RelationNotFound(relid))?;
        rel.parent = None;
        rel.bound = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;

    fn catalog_with_parent() -> (InMemoryCatalog, RelationId) {
        let catalog = InMemoryCatalog::new();
        let id = catalog
            .create_table(1, "measurements", vec![Column::new("id", DataType::Integer, false)])
            .unwrap();
        (catalog, id)
    }

    fn range(lo: i64, hi: i64) -> BoundaryDescriptor {
        BoundaryDescriptor::Range {
            lower: Some(Value::Integer(lo)),
            upper: Some(Value::Integer(hi)),
        }
    }

    #[test]
    fn test_create_and_list_partitions() {
        let (catalog, parent) = catalog_with_parent();
        let p1 = catalog.create_partition(parent, range(1, 11), 7).unwrap();
        let p2 = catalog.create_partition(parent, range(11, 21), 7).unwrap();

        let children = catalog.children(parent).unwrap();
        assert_eq!(children.iter().map(|c| c.relid).collect::<Vec<_>>(), vec![p1, p2]);
        assert_eq!(children[0].created_by, 7);

        let meta = catalog.relation(p2).unwrap().unwrap();
        assert_eq!(meta.name, "measurements_2");
        assert_eq!(meta.column_index("id"), Some(0));
    }

    #[test]
    fn test_duplicate_table_name() {
        let (catalog, _) = catalog_with_parent();
        assert!(catalog.create_table(1, "measurements", vec![]).is_err());
        assert!(catalog.create_table(2, "measurements", vec![]).is_ok());
    }

    #[test]
    fn test_injected_failure() {
        let (catalog, parent) = catalog_with_parent();
        catalog.fail_creations_after(1);
        assert!(catalog.create_partition(parent, range(1, 11), 1).is_ok());
        assert!(matches!(
            catalog.create_partition(parent, range(11, 21), 1),
            Err(PathmanError::CreationFailure(_))
        ));
        assert_eq!(catalog.children(parent).unwrap().len(), 1);
    }

    #[test]
    fn test_detach_and_drop() {
        let (catalog, parent) = catalog_with_parent();
        let p1 = catalog.create_partition(parent, range(1, 11), 1).unwrap();
        let p2 = catalog.create_partition(parent, range(11, 21), 1).unwrap();
        catalog.insert_row(p1, Row::new(vec![Value::Integer(3)])).unwrap();

        catalog.detach_partition(p1).unwrap();
        catalog.drop_relation(p2).unwrap();
        assert!(catalog.children(parent).unwrap().is_empty());
        assert_eq!(catalog.row_count(p1), 1);
        assert!(catalog.relation(p2).unwrap().is_none());
    }
}
