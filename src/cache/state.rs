//! Process-wide partitioning cache
//!
//! Maps `(database, relation)` to an immutable `PartRelationInfo` built from
//! the configuration store and the host catalog. Three locks split the work:
//! `databases` guards the map itself, `load_lock` serializes (re)loads and
//! `edit_lock` serializes structural edits of any directory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::catalog::{BoundaryDescriptor, ConfigStore, HostCatalog, PathmanConfig};
use crate::core::{DatabaseId, PathmanError, RelationId, Result, Value};
use crate::partition::{
    Directory, HashDirectory, PartRelationInfo, PartType, RangeDirectory, RangeEntry, RangeInterval,
    TypeComparator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    Loading,
    Ready,
    Disabled,
    Invalidated,
}

#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Partitioning is disabled or not initialized; treat the relation as a plain table
    NotReady,
    NotPartitioned,
    Found(Arc<PartRelationInfo>),
}

#[derive(Debug, Default)]
struct DatabaseCache {
    loaded: bool,
    relations: HashMap<RelationId, Arc<PartRelationInfo>>,
    /// Records that failed validation, with the reason
    broken: HashMap<RelationId, String>,
    /// Invalidated entries, rebuilt on next access
    stale: HashSet<RelationId>,
}

pub struct PathmanState {
    enabled: AtomicBool,
    state: RwLock<CacheState>,
    databases: RwLock<HashMap<DatabaseId, DatabaseCache>>,
    load_lock: Mutex<()>,
    edit_lock: Mutex<()>,
    store: Arc<dyn ConfigStore>,
    catalog: Arc<dyn HostCatalog>,
}

impl std::fmt::Debug for PathmanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathmanState")
            .field("enabled", &self.enabled)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl PathmanState {
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>, catalog: Arc<dyn HostCatalog>, enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            state: RwLock::new(if enabled { CacheState::Uninitialized } else { CacheState::Disabled }),
            databases: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
            edit_lock: Mutex::new(()),
            store,
            catalog,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn HostCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn state(&self) -> CacheState {
        *self.state.read()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enabled and initialized
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_enabled() && self.state() == CacheState::Ready
    }

    /// Process-wide toggle.
    ///
    /// Disabling takes effect at once and is a no-op on a cache that never
    /// loaded. Enabling only schedules a lazy reload for the next access.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        let mut state = self.state.write();
        if enabled {
            if !was || *state == CacheState::Disabled {
                info!(from = ?*state, "partitioning enabled, cache will reload on next access");
                *state = CacheState::Uninitialized;
            }
        } else {
            if *state != CacheState::Disabled {
                info!(from = ?*state, "partitioning disabled");
            }
            *state = CacheState::Disabled;
            // Readers keep their Arcs; memory goes away with the last one
            self.databases.write().clear();
        }
    }

    /// Serializes structural edits of partition directories
    pub fn edit_lock(&self) -> MutexGuard<'_, ()> {
        self.edit_lock.lock()
    }

    fn ensure_initialized(&self) {
        if *self.state.read() == CacheState::Ready {
            return;
        }

        let _load = self.load_lock.lock();
        let mut state = self.state.write();
        if *state == CacheState::Ready || !self.is_enabled() {
            return;
        }
        debug!(from = ?*state, "initializing partitioning cache");
        *state = CacheState::Loading;
        self.databases.write().clear();
        *state = CacheState::Ready;
        info!("partitioning cache ready");
    }

    /// Looks up the partitioning of `relid`, loading it on first access
    pub fn lookup(&self, database: DatabaseId, relid: RelationId) -> Result<CacheLookup> {
        if !self.is_enabled() {
            return Ok(CacheLookup::NotReady);
        }
        self.ensure_initialized();

        loop {
            let needs_load = {
                let databases = self.databases.read();
                match databases.get(&database) {
                    Some(db) if db.loaded && !db.stale.contains(&relid) => {
                        if let Some(info) = db.relations.get(&relid) {
                            return Ok(CacheLookup::Found(Arc::clone(info)));
                        }
                        if let Some(reason) = db.broken.get(&relid) {
                            return Err(PathmanError::inconsistent(relid, reason.clone()));
                        }
                        return Ok(CacheLookup::NotPartitioned);
                    }
                    Some(db) if db.loaded => LoadScope::Relation,
                    _ => LoadScope::Database,
                }
            };

            match needs_load {
                LoadScope::Database => self.load_database(database)?,
                LoadScope::Relation => self.load_relation(database, relid)?,
            }

            // Disabled while we were loading. A concurrent `invalidate_all`
            // only means the map has to be filled again.
            if !self.is_enabled() {
                return Ok(CacheLookup::NotReady);
            }
            self.ensure_initialized();
        }
    }

    /// Like `lookup`, but `NotReady` and `NotPartitioned` are errors
    pub fn relation_info(&self, database: DatabaseId, relid: RelationId) -> Result<Arc<PartRelationInfo>> {
        match self.lookup(database, relid)? {
            CacheLookup::Found(info) => Ok(info),
            CacheLookup::NotPartitioned | CacheLookup::NotReady => Err(PathmanError::NotPartitioned(relid)),
        }
    }

    fn load_database(&self, database: DatabaseId) -> Result<()> {
        let _load = self.load_lock.lock();
        if self.databases.read().get(&database).is_some_and(|db| db.loaded) {
            return Ok(());
        }

        let mut cache = DatabaseCache {
            loaded: true,
            ..DatabaseCache::default()
        };
        for record in self.store.records(database)? {
            let relid = record.partrel;
            match self.build(&record) {
                Ok(info) => {
                    cache.relations.insert(relid, Arc::new(info));
                }
                Err(PathmanError::ConfigurationInconsistent { reason, .. }) => {
                    warn!(database, relid, %reason, "skipping inconsistent partitioning configuration");
                    cache.broken.insert(relid, reason);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            database,
            relations = cache.relations.len(),
            inconsistent = cache.broken.len(),
            "loaded partitioning configuration"
        );
        if self.is_enabled() {
            self.databases.write().insert(database, cache);
        }
        Ok(())
    }

    fn load_relation(&self, database: DatabaseId, relid: RelationId) -> Result<()> {
        let _load = self.load_lock.lock();
        let built = match self.store.get(database, relid)? {
            None => None,
            Some(record) => Some(self.build(&record)),
        };

        let mut databases = self.databases.write();
        let Some(db) = databases.get_mut(&database) else {
            return Ok(());
        };
        db.stale.remove(&relid);
        db.relations.remove(&relid);
        db.broken.remove(&relid);
        match built {
            None => debug!(database, relid, "relation is no longer partitioned"),
            Some(Ok(info)) => {
                debug!(database, relid, partitions = info.children_count(), "rebuilt cache entry");
                db.relations.insert(relid, Arc::new(info));
            }
            Some(Err(PathmanError::ConfigurationInconsistent { reason, .. })) => {
                warn!(database, relid, %reason, "partitioning configuration is inconsistent");
                db.broken.insert(relid, reason);
            }
            Some(Err(e)) => return Err(e),
        }
        Ok(())
    }

    /// Validates a configuration record against the catalog and builds its view
    pub fn build(&self, record: &PathmanConfig) -> Result<PartRelationInfo> {
        let relid = record.partrel;
        let parent = self
            .catalog
            .relation(relid)?
            .ok_or_else(|| PathmanError::inconsistent(relid, "partitioned relation does not exist"))?;
        let column_index = parent.column_index(&record.attname).ok_or_else(|| {
            PathmanError::inconsistent(relid, format!("partition column \"{}\" does not exist", record.attname))
        })?;
        let data_type = parent.columns[column_index].data_type.clone();
        let cmp = Arc::new(TypeComparator::new(data_type.clone()));
        let children = self.catalog.children(relid)?;

        let as_inconsistent = |e: PathmanError| match e {
            PathmanError::ConfigurationInconsistent { .. } => e,
            other => PathmanError::inconsistent(relid, other.to_string()),
        };

        let (directory, interval) = match record.parttype {
            PartType::Range => {
                let mut entries = Vec::with_capacity(children.len());
                for child in &children {
                    let BoundaryDescriptor::Range { lower, upper } = &child.bound else {
                        return Err(PathmanError::inconsistent(
                            relid,
                            format!("partition {} has a hash boundary", child.relid),
                        ));
                    };
                    let coerce = |v: &Option<Value>| v.as_ref().map(|v| data_type.coerce(v)).transpose();
                    entries.push(RangeEntry {
                        partition: child.relid,
                        lower: coerce(lower).map_err(as_inconsistent)?,
                        upper: coerce(upper).map_err(as_inconsistent)?,
                        created_by: child.created_by,
                    });
                }
                let directory = RangeDirectory::build(relid, entries, cmp.as_ref())?;
                let interval = record
                    .range_interval
                    .as_deref()
                    .map(|text| RangeInterval::parse(text, &data_type))
                    .transpose()
                    .map_err(as_inconsistent)?;
                (Directory::Range(directory), interval)
            }
            PartType::Hash => {
                let mut buckets = Vec::with_capacity(children.len());
                for child in &children {
                    let BoundaryDescriptor::Hash(bucket) = child.bound else {
                        return Err(PathmanError::inconsistent(
                            relid,
                            format!("partition {} has a range boundary", child.relid),
                        ));
                    };
                    buckets.push((bucket, child.relid));
                }
                (Directory::Hash(HashDirectory::build(relid, &buckets)?), None)
            }
        };

        Ok(PartRelationInfo::new(
            record.database,
            relid,
            record.attname.clone(),
            column_index,
            data_type,
            interval,
            record.params,
            record.created_by,
            directory,
            cmp,
        ))
    }

    /// Publishes a new snapshot of a relation, replacing the previous one.
    ///
    /// Returns `false` when partitioning is disabled; the snapshot is then
    /// discarded and the caller owns whatever it created for it. The state
    /// lock is held across the publication so a concurrent disable either
    /// happens before (refused) or clears the snapshot afterwards.
    pub fn install(&self, info: PartRelationInfo) -> bool {
        let state = self.state.read();
        if !self.is_enabled() || *state == CacheState::Disabled {
            return false;
        }
        if *state != CacheState::Ready {
            // The next initialization reads the catalog, new children included
            return true;
        }
        let (database, relid) = (info.database, info.parent);
        let mut databases = self.databases.write();
        let db = databases.entry(database).or_default();
        if !db.loaded {
            // Loaded lazily together with the rest of the database
            return true;
        }
        db.stale.remove(&relid);
        db.broken.remove(&relid);
        db.relations.insert(relid, Arc::new(info));
        debug!(database, relid, "installed new directory snapshot");
        true
    }

    /// Drops one relation's entry; it is rebuilt on next access
    pub fn invalidate_relation(&self, database: DatabaseId, relid: RelationId) {
        if let Some(db) = self.databases.write().get_mut(&database) {
            db.relations.remove(&relid);
            db.broken.remove(&relid);
            db.stale.insert(relid);
            debug!(database, relid, "invalidated cache entry");
        }
    }

    /// Drops everything; the whole cache reloads on next access
    pub fn invalidate_all(&self) {
        let mut state = self.state.write();
        if *state == CacheState::Ready {
            *state = CacheState::Invalidated;
            info!("partitioning cache invalidated");
        }
        self.databases.write().clear();
    }
}

enum LoadScope {
    Database,
    Relation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, MemoryConfigStore};
    use crate::core::{Column, DataType};
    use crate::partition::HashBucket;

    struct Fixture {
        store: Arc<MemoryConfigStore>,
        catalog: Arc<InMemoryCatalog>,
        state: PathmanState,
        parent: RelationId,
    }

    fn range(lo: i64, hi: i64) -> BoundaryDescriptor {
        BoundaryDescriptor::Range {
            lower: Some(Value::Integer(lo)),
            upper: Some(Value::Integer(hi)),
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryConfigStore::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let parent = catalog
            .create_table(1, "events", vec![Column::new("id", DataType::Integer, false)])
            .unwrap();
        catalog.create_partition(parent, range(1, 11), 1).unwrap();
        catalog.create_partition(parent, range(11, 21), 1).unwrap();
        store
            .insert(PathmanConfig::range(1, parent, "id", Some("10".to_string()), 1))
            .unwrap();
        let state = PathmanState::new(store.clone(), catalog.clone(), true);
        Fixture { store, catalog, state, parent }
    }

    #[test]
    fn test_lazy_load() {
        let f = fixture();
        assert_eq!(f.state.state(), CacheState::Uninitialized);

        let CacheLookup::Found(info) = f.state.lookup(1, f.parent).unwrap() else {
            panic!("expected a cache entry");
        };
        assert_eq!(info.children_count(), 2);
        assert_eq!(info.interval, Some(RangeInterval::Integer(10)));
        assert_eq!(f.state.state(), CacheState::Ready);

        assert!(matches!(f.state.lookup(1, 9999).unwrap(), CacheLookup::NotPartitioned));
        assert!(matches!(f.state.lookup(2, f.parent).unwrap(), CacheLookup::NotPartitioned));
    }

    #[test]
    fn test_disable_is_immediate_and_enable_is_lazy() {
        let f = fixture();
        let held = f.state.relation_info(1, f.parent).unwrap();

        f.state.set_enabled(false);
        assert_eq!(f.state.state(), CacheState::Disabled);
        assert!(matches!(f.state.lookup(1, f.parent).unwrap(), CacheLookup::NotReady));
        // Readers that got in before keep a consistent view
        assert_eq!(held.children_count(), 2);

        f.state.set_enabled(true);
        assert_eq!(f.state.state(), CacheState::Uninitialized);
        assert!(matches!(f.state.lookup(1, f.parent).unwrap(), CacheLookup::Found(_)));
    }

    #[test]
    fn test_disable_before_init_is_noop() {
        let store = Arc::new(MemoryConfigStore::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let state = PathmanState::new(store, catalog, true);
        state.set_enabled(false);
        state.set_enabled(false);
        assert_eq!(state.state(), CacheState::Disabled);
        assert!(matches!(state.lookup(1, 1).unwrap(), CacheLookup::NotReady));
    }

    #[test]
    fn test_invalidate_relation_rebuilds() {
        let f = fixture();
        assert_eq!(f.state.relation_info(1, f.parent).unwrap().children_count(), 2);

        f.catalog.create_partition(f.parent, range(21, 31), 2).unwrap();
        // Still the cached snapshot
        assert_eq!(f.state.relation_info(1, f.parent).unwrap().children_count(), 2);

        f.state.invalidate_relation(1, f.parent);
        assert_eq!(f.state.relation_info(1, f.parent).unwrap().children_count(), 3);

        f.store.remove(1, f.parent).unwrap();
        f.state.invalidate_all();
        assert_eq!(f.state.state(), CacheState::Invalidated);
        assert!(matches!(f.state.lookup(1, f.parent).unwrap(), CacheLookup::NotPartitioned));
        assert_eq!(f.state.state(), CacheState::Ready);
    }

    #[test_log::test]
    fn test_inconsistent_records_are_skipped() {
        let f = fixture();
        // Overlapping partition
        f.catalog.create_partition(f.parent, range(5, 15), 1).unwrap();

        let other = f
            .catalog
            .create_table(1, "other", vec![Column::new("id", DataType::Integer, false)])
            .unwrap();
        f.catalog
            .create_partition(other, BoundaryDescriptor::Hash(HashBucket { bucket: 0, buckets: 1 }), 1)
            .unwrap();
        f.store.insert(PathmanConfig::hash(1, other, "id", 1)).unwrap();

        assert!(matches!(
            f.state.lookup(1, f.parent),
            Err(PathmanError::ConfigurationInconsistent { .. })
        ));
        assert!(matches!(f.state.lookup(1, other).unwrap(), CacheLookup::Found(_)));
    }

    #[test]
    fn test_build_validation() {
        let f = fixture();
        let missing_column = PathmanConfig::range(1, f.parent, "nope", None, 1);
        assert!(matches!(f.state.build(&missing_column), Err(PathmanError::ConfigurationInconsistent { .. })));

        let bad_interval = PathmanConfig::range(1, f.parent, "id", Some("ten".to_string()), 1);
        assert!(matches!(f.state.build(&bad_interval), Err(PathmanError::ConfigurationInconsistent { .. })));

        let wrong_kind = PathmanConfig::hash(1, f.parent, "id", 1);
        assert!(matches!(f.state.build(&wrong_kind), Err(PathmanError::ConfigurationInconsistent { .. })));

        let missing_parent = PathmanConfig::hash(1, 4242, "id", 1);
        assert!(matches!(f.state.build(&missing_parent), Err(PathmanError::ConfigurationInconsistent { .. })));
    }

    #[test]
    fn test_overflowing_stored_interval_is_inconsistent() {
        let store = Arc::new(MemoryConfigStore::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let parent = catalog
            .create_table(1, "days", vec![Column::new("day", DataType::Date, false)])
            .unwrap();
        let huge = "4294967295 weeks 4294967295 weeks 4294967295 weeks 4294967295 weeks";
        store
            .insert(PathmanConfig::range(1, parent, "day", Some(huge.to_string()), 1))
            .unwrap();
        let state = PathmanState::new(store, catalog, true);

        assert!(matches!(
            state.lookup(1, parent),
            Err(PathmanError::ConfigurationInconsistent { .. })
        ));
    }

    #[test]
    fn test_lookup_survives_concurrent_invalidate_all() {
        use std::sync::atomic::AtomicUsize;

        let f = fixture();
        let stop = AtomicBool::new(false);
        let not_ready = AtomicUsize::new(0);

        std::thread::scope(|s| {
            s.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    f.state.invalidate_all();
                }
            });
            for _ in 0..20_000 {
                match f.state.lookup(1, f.parent).unwrap() {
                    CacheLookup::Found(info) => assert_eq!(info.children_count(), 2),
                    CacheLookup::NotReady => {
                        not_ready.fetch_add(1, Ordering::Relaxed);
                    }
                    CacheLookup::NotPartitioned => panic!("relation lost its partitioning"),
                }
            }
            stop.store(true, Ordering::Relaxed);
        });

        assert_eq!(not_ready.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_install_is_refused_once_disabled() {
        let f = fixture();
        let info = f.state.relation_info(1, f.parent).unwrap();

        // Ready: published
        assert!(f.state.install(info.as_ref().clone()));
        // Invalidated: accepted, the reload picks the catalog up
        f.state.invalidate_all();
        assert!(f.state.install(info.as_ref().clone()));

        f.state.set_enabled(false);
        assert!(!f.state.install(info.as_ref().clone()));
        f.state.set_enabled(true);
        assert!(matches!(f.state.lookup(1, f.parent).unwrap(), CacheLookup::Found(_)));
    }
}
