//! Persistent store of partitioning configuration records

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{DatabaseId, PathmanError, RelationId, Result};
use super::config_record::{ConfigParams, PathmanConfig};

/// Storage of `PathmanConfig` records, one per partitioned relation.
///
/// The store is the source of truth; everything cached is derived from it.
pub trait ConfigStore: Send + Sync {
    /// Inserts a record and returns its sequence id.
    /// Fails with `AlreadyPartitioned` when the relation already has one.
    fn insert(&self, config: PathmanConfig) -> Result<u64>;

    /// Removes the record of a relation, returning it if it existed
    fn remove(&self, database: DatabaseId, relid: RelationId) -> Result<Option<PathmanConfig>>;

    fn get(&self, database: DatabaseId, relid: RelationId) -> Result<Option<PathmanConfig>>;

    /// All records of one database, ordered by relation id
    fn records(&self, database: DatabaseId) -> Result<Vec<PathmanConfig>>;

    fn update_params(&self, database: DatabaseId, relid: RelationId, params: ConfigParams) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ConfigTable {
    next_id: u64,
    rows: BTreeMap<(DatabaseId, RelationId), PathmanConfig>,
}

impl ConfigTable {
    fn insert(&mut self, mut config: PathmanConfig) -> Result<u64> {
        let key = (config.database, config.partrel);
        if self.rows.contains_key(&key) {
            return Err(PathmanError::AlreadyPartitioned(config.partrel));
        }
        self.next_id += 1;
        config.id = self.next_id;
        self.rows.insert(key, config);
        Ok(self.next_id)
    }

    fn records(&self, database: DatabaseId) -> Vec<PathmanConfig> {
        self.rows
            .range((database, RelationId::MIN)..=(database, RelationId::MAX))
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn update_params(&mut self, database: DatabaseId, relid: RelationId, params: ConfigParams) -> Result<()> {
        let row = self
            .rows
            .get_mut(&(database, relid))
            .ok_or(PathmanError::NotPartitioned(relid))?;
        row.params = params;
        Ok(())
    }
}

/// Store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    table: RwLock<ConfigTable>,
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn insert(&self, config: PathmanConfig) -> Result<u64> {
        self.table.write().insert(config)
    }

    fn remove(&self, database: DatabaseId, relid: RelationId) -> Result<Option<PathmanConfig>> {
        Ok(self.table.write().rows.remove(&(database, relid)))
    }

    fn get(&self, database: DatabaseId, relid: RelationId) -> Result<Option<PathmanConfig>> {
        Ok(self.table.read().rows.get(&(database, relid)).cloned())
    }

    fn records(&self, database: DatabaseId) -> Result<Vec<PathmanConfig>> {
        Ok(self.table.read().records(database))
    }

    fn update_params(&self, database: DatabaseId, relid: RelationId, params: ConfigParams) -> Result<()> {
        self.table.write().update_params(database, relid, params)
    }
}

/// Store persisted as a bincode snapshot in `data_dir/pathman_config.db`.
///
/// Every change rewrites the snapshot through a temporary file and a rename,
/// so a crash leaves either the old or the new table on disk.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    table: RwLock<ConfigTable>,
}

impl FileConfigStore {
    pub const FILE_NAME: &'static str = "pathman_config.db";

    /// Opens the store in `data_dir`, creating the directory if needed
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(Self::FILE_NAME);

        let table = if path.exists() {
            let data = fs::read(&path)?;
            bincode::deserialize(&data).map_err(|e| PathmanError::Serialization(e.to_string()))?
        } else {
            ConfigTable::default()
        };
        debug!(path = %path.display(), records = table.rows.len(), "opened configuration store");

        Ok(Self {
            path,
            table: RwLock::new(table),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, table: &ConfigTable) -> Result<()> {
        let encoded = bincode::serialize(table).map_err(|e| PathmanError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("db.tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Applies `change` to a copy of the table and persists it before publishing
    fn modify<T>(&self, change: impl FnOnce(&mut ConfigTable) -> Result<T>) -> Result<T> {
        let mut table = self.table.write();
        let mut next = table.clone();
        let out = change(&mut next)?;
        self.save(&next)?;
        *table = next;
        Ok(out)
    }
}

impl ConfigStore for FileConfigStore {
    fn insert(&self, config: PathmanConfig) -> Result<u64> {
        self.modify(|t| t.insert(config))
    }

    fn remove(&self, database: DatabaseId, relid: RelationId) -> Result<Option<PathmanConfig>> {
        self.modify(|t| Ok(t.rows.remove(&(database, relid))))
    }

    fn get(&self, database: DatabaseId, relid: RelationId) -> Result<Option<PathmanConfig>> {
        Ok(self.table.read().rows.get(&(database, relid)).cloned())
    }

    fn records(&self, database: DatabaseId) -> Result<Vec<PathmanConfig>> {
        Ok(self.table.read().records(database))
    }

    fn update_params(&self, database: DatabaseId, relid: RelationId, params: ConfigParams) -> Result<()> {
        self.modify(|t| t.update_params(database, relid, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_insert_and_lookup() {
        let store = MemoryConfigStore::new();
        let id = store.insert(PathmanConfig::range(1, 10, "id", Some("10".to_string()), 5)).unwrap();
        assert_eq!(id, 1);

        let rec = store.get(1, 10).unwrap().unwrap();
        assert_eq!(rec.id, 1);
        assert_eq!(rec.attname, "id");
        assert!(store.get(2, 10).unwrap().is_none());

        assert!(matches!(
            store.insert(PathmanConfig::hash(1, 10, "id", 6)),
            Err(PathmanError::AlreadyPartitioned(10))
        ));
    }

    #[test]
    fn test_records_are_per_database() {
        let store = MemoryConfigStore::new();
        store.insert(PathmanConfig::hash(1, 20, "a", 1)).unwrap();
        store.insert(PathmanConfig::hash(1, 10, "a", 1)).unwrap();
        store.insert(PathmanConfig::hash(2, 15, "a", 1)).unwrap();

        let ids: Vec<_> = store.records(1).unwrap().iter().map(|r| r.partrel).collect();
        assert_eq!(ids, vec![10, 20]);
        assert_eq!(store.records(2).unwrap().len(), 1);
    }

    #[test]
    fn test_update_params_of_unknown_relation() {
        let store = MemoryConfigStore::new();
        assert!(matches!(
            store.update_params(1, 99, ConfigParams::default()),
            Err(PathmanError::NotPartitioned(99))
        ));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileConfigStore::open(temp_dir.path()).unwrap();
            store.insert(PathmanConfig::range(1, 10, "id", Some("100".to_string()), 3)).unwrap();
            let params = ConfigParams { auto: false, ..ConfigParams::default() };
            store.update_params(1, 10, params).unwrap();
            store.insert(PathmanConfig::hash(1, 11, "id", 3)).unwrap();
            store.remove(1, 11).unwrap();
        }

        let store = FileConfigStore::open(temp_dir.path()).unwrap();
        let rec = store.get(1, 10).unwrap().unwrap();
        assert_eq!(rec.range_interval.as_deref(), Some("100"));
        assert!(!rec.params.auto);
        assert!(store.get(1, 11).unwrap().is_none());
        // Ids keep growing after a reopen
        assert_eq!(store.insert(PathmanConfig::hash(1, 12, "id", 4)).unwrap(), 3);
    }

    #[test]
    fn test_failed_change_is_not_published() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileConfigStore::open(temp_dir.path()).unwrap();
        store.insert(PathmanConfig::hash(1, 10, "id", 1)).unwrap();
        assert!(store.insert(PathmanConfig::hash(1, 10, "id", 1)).is_err());
        assert_eq!(store.records(1).unwrap().len(), 1);
    }
}
