//! `Pathman` service: the boundary the host planner and executor talk to
//!
//! One instance per process. It owns the partitioning cache, the creation
//! orchestrator and the lock guard, and exposes
//! - planning: `prune`, `prune_with_params`
//! - execution: `find_insert_target`, `route_insert`
//! - the process-wide enable switch
//! - partition management functions

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{CacheLookup, PathmanState};
use crate::catalog::{
    BoundaryDescriptor, ConfigParams, ConfigStore, FileConfigStore, HostCatalog, MemoryConfigStore, PathmanConfig,
};
use crate::core::{DatabaseId, PathmanError, RelationId, Result, Row, Value, INVALID_OID};
use crate::creation::{CreationOrchestrator, CreationOutcome, CreationRequest};
use crate::partition::{Directory, HashBucket, PartRelationInfo, RangeEntry, RangeInterval, SearchResult};
use crate::pruning::{self, Expr, PruneResult};
use crate::settings::PathmanSettings;
use crate::transaction::{
    GlobalTransactionManager, HostLockManager, IsolationLevel, LockManager, Transaction, XactGuard,
};

/// What the planner has to scan for a relation
#[derive(Debug, Clone)]
pub enum ScanPlan {
    /// Partitioning is disabled or not initialized; scan the relation as a plain table
    NotReady,
    NotPartitioned,
    Partitioned {
        result: PruneResult,
        /// `enable_parent` is set, the parent's own rows are scanned too
        parent_included: bool,
    },
}

impl ScanPlan {
    /// Relations to scan for a query on `relid`
    #[must_use]
    pub fn relations(&self, relid: RelationId) -> Vec<RelationId> {
        match self {
            Self::NotReady | Self::NotPartitioned => vec![relid],
            Self::Partitioned { result, parent_included } => {
                let mut relations = Vec::with_capacity(result.partitions.len() + 1);
                if *parent_included {
                    relations.push(relid);
                }
                relations.extend(result.relation_ids());
                relations
            }
        }
    }
}

/// Where a row goes
#[derive(Debug, Clone, PartialEq)]
pub enum InsertTarget {
    Relation(RelationId),
    /// No partition covers the key yet
    Create(CreationRequest),
}

/// One partition as shown by `partition_list`
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionRow {
    pub parent: RelationId,
    pub partition: RelationId,
    pub name: String,
    pub bound: BoundaryDescriptor,
}

pub struct Pathman {
    settings: PathmanSettings,
    state: Arc<PathmanState>,
    gtm: GlobalTransactionManager,
    guard: XactGuard,
    orchestrator: CreationOrchestrator,
}

impl std::fmt::Debug for Pathman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pathman")
            .field("settings", &self.settings)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Pathman {
    pub fn new(settings: PathmanSettings, store: Arc<dyn ConfigStore>, catalog: Arc<dyn HostCatalog>) -> Result<Self> {
        let locks: Arc<dyn LockManager> = Arc::new(HostLockManager::new(settings.lock_timeout()));
        Self::with_lock_manager(settings, store, catalog, locks)
    }

    pub fn with_lock_manager(
        settings: PathmanSettings,
        store: Arc<dyn ConfigStore>,
        catalog: Arc<dyn HostCatalog>,
        locks: Arc<dyn LockManager>,
    ) -> Result<Self> {
        let gtm = GlobalTransactionManager::new(Arc::clone(&locks));
        let guard = XactGuard::new(locks);
        let state = Arc::new(PathmanState::new(store, catalog, settings.enable));
        let orchestrator = CreationOrchestrator::new(Arc::clone(&state), gtm.clone(), guard.clone(), &settings)?;

        info!(
            enabled = settings.enable,
            auto = settings.enable_auto_partition,
            workers = orchestrator.has_workers(),
            "pathman started"
        );
        Ok(Self {
            settings,
            state,
            gtm,
            guard,
            orchestrator,
        })
    }

    /// Configuration store for `settings`: a file under `data_dir`, in memory otherwise
    pub fn open_store(settings: &PathmanSettings) -> Result<Arc<dyn ConfigStore>> {
        let store: Arc<dyn ConfigStore> = match &settings.data_dir {
            Some(dir) => Arc::new(FileConfigStore::open(dir)?),
            None => Arc::new(MemoryConfigStore::new()),
        };
        Ok(store)
    }

    #[must_use]
    pub const fn settings(&self) -> &PathmanSettings {
        &self.settings
    }

    #[must_use]
    pub fn state(&self) -> &PathmanState {
        &self.state
    }

    #[must_use]
    pub const fn transactions(&self) -> &GlobalTransactionManager {
        &self.gtm
    }

    #[must_use]
    pub const fn guard(&self) -> &XactGuard {
        &self.guard
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn HostCatalog> {
        self.state.catalog()
    }

    fn store(&self) -> &Arc<dyn ConfigStore> {
        self.state.store()
    }

    pub fn begin(&self, database: DatabaseId, isolation: IsolationLevel) -> Transaction {
        self.gtm.begin(database, isolation)
    }

    pub fn commit(&self, tx: &Transaction) {
        self.gtm.commit(tx);
    }

    pub fn rollback(&self, tx: &Transaction) {
        self.gtm.rollback(tx);
    }

    pub fn enable(&self) {
        self.state.set_enabled(true);
    }

    pub fn disable(&self) {
        self.state.set_enabled(false);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    // ---- planner boundary ----

    fn plan(
        &self,
        database: DatabaseId,
        relid: RelationId,
        run: impl FnOnce(&PartRelationInfo) -> Result<PruneResult>,
    ) -> Result<ScanPlan> {
        let info = match self.state.lookup(database, relid)? {
            CacheLookup::NotReady => return Ok(ScanPlan::NotReady),
            CacheLookup::NotPartitioned => return Ok(ScanPlan::NotPartitioned),
            CacheLookup::Found(info) => info,
        };
        let result = run(info.as_ref())?;
        Ok(ScanPlan::Partitioned {
            result,
            parent_included: info.params.enable_parent,
        })
    }

    /// Planning-time pruning of `relid` for the predicate `expr`
    pub fn prune(&self, database: DatabaseId, relid: RelationId, expr: &Expr) -> Result<ScanPlan> {
        self.plan(database, relid, |info| pruning::prune(expr, info))
    }

    /// Execution-time pruning with `$n` bound to `params[n - 1]`
    pub fn prune_with_params(
        &self,
        database: DatabaseId,
        relid: RelationId,
        expr: &Expr,
        params: &[Value],
    ) -> Result<ScanPlan> {
        self.plan(database, relid, |info| pruning::prune_with_params(expr, info, params))
    }

    // ---- executor boundary ----

    /// Finds the partition `row` belongs to without creating anything
    pub fn find_insert_target(&self, tx: &Transaction, relid: RelationId, row: &Row) -> Result<InsertTarget> {
        let info = match self.state.lookup(tx.database, relid)? {
            CacheLookup::NotReady | CacheLookup::NotPartitioned => return Ok(InsertTarget::Relation(relid)),
            CacheLookup::Found(info) => info,
        };
        let key = row.get(info.column_index).ok_or_else(|| {
            PathmanError::InvalidRequest(format!("row has no value for partition column \"{}\"", info.column))
        })?;

        match info.locate(key)? {
            SearchResult::Found(i) => info
                .child(i)
                .map(InsertTarget::Relation)
                .ok_or_else(|| PathmanError::inconsistent(relid, format!("no partition at position {i}"))),
            SearchResult::Gap(_) | SearchResult::OutOfRange(_) => {
                if self.settings.enable_auto_partition && info.params.auto && info.interval.is_some() {
                    Ok(InsertTarget::Create(CreationRequest {
                        database: tx.database,
                        relid,
                        value: info.key_of(key)?,
                    }))
                } else {
                    Err(PathmanError::InvalidRequest(format!(
                        "no suitable partition for key '{key}' in relation {relid}"
                    )))
                }
            }
        }
    }

    /// Routes `row` to its partition, creating the partition on demand
    pub fn route_insert(&self, tx: &Transaction, relid: RelationId, row: &Row) -> Result<RelationId> {
        match self.find_insert_target(tx, relid, row)? {
            InsertTarget::Relation(target) => Ok(target),
            InsertTarget::Create(request) => {
                match self.orchestrator.create_partition_for_value(tx, relid, &request.value)? {
                    CreationOutcome::Installed { partition, .. } => Ok(partition),
                    CreationOutcome::Abandoned => {
                        debug!(relid, "partitioning disabled, inserting into parent");
                        Ok(relid)
                    }
                }
            }
        }
    }

    /// Creates (or finds) the partition covering `value`
    pub fn create_partition_for_value(&self, tx: &Transaction, relid: RelationId, value: &Value) -> Result<CreationOutcome> {
        self.orchestrator.create_partition_for_value(tx, relid, value)
    }

    // ---- management functions ----

    fn parent_meta(&self, relid: RelationId) -> Result<crate::catalog::RelationMeta> {
        let meta = self.catalog().relation(relid)?.ok_or(PathmanError::RelationNotFound(relid))?;
        if meta.parent.is_some() {
            return Err(PathmanError::InvalidRequest(format!(
                "relation \"{}\" is a partition",
                meta.name
            )));
        }
        Ok(meta)
    }

    /// Creates children one by one, dropping the ones already created on failure
    fn create_children(
        &self,
        tx: &Transaction,
        relid: RelationId,
        bounds: impl IntoIterator<Item = BoundaryDescriptor>,
    ) -> Result<Vec<RelationId>> {
        let mut created = Vec::new();
        for bound in bounds {
            match self.catalog().create_partition(relid, bound, tx.xid) {
                Ok(partition) => created.push(partition),
                Err(e) => {
                    self.drop_children(&created);
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    fn drop_children(&self, created: &[RelationId]) {
        for &partition in created.iter().rev() {
            if let Err(e) = self.catalog().drop_relation(partition) {
                tracing::error!(partition, error = %e, "could not drop partition");
            }
        }
    }

    /// Partitions `relid` by range: `count` partitions of width `interval` from `start`
    pub fn create_range_partitions(
        &self,
        tx: &Transaction,
        relid: RelationId,
        column: &str,
        start: &Value,
        interval: &str,
        count: usize,
    ) -> Result<Vec<RelationId>> {
        self.guard.prevent_relation_modification(tx, relid)?;
        let _lock = self.guard.partitioned_rel_lock(tx, relid)?;
        let _edit = self.state.edit_lock();

        let meta = self.parent_meta(relid)?;
        if self.store().get(tx.database, relid)?.is_some() {
            return Err(PathmanError::AlreadyPartitioned(relid));
        }
        let index = meta
            .column_index(column)
            .ok_or_else(|| PathmanError::ColumnNotFound(column.to_string()))?;
        let data_type = &meta.columns[index].data_type;
        if !data_type.supports_interval() {
            return Err(PathmanError::InvalidRequest(format!(
                "column \"{column}\" of type {data_type} cannot be range partitioned"
            )));
        }
        let step = RangeInterval::parse(interval, data_type)?;
        let start = data_type.coerce(start)?;
        if start.is_null() {
            return Err(PathmanError::InvalidRequest("start value cannot be NULL".to_string()));
        }

        let mut bounds = Vec::with_capacity(count);
        let mut lower = start;
        for _ in 0..count {
            let upper = step.add_to(&lower)?;
            bounds.push(BoundaryDescriptor::Range {
                lower: Some(lower),
                upper: Some(upper.clone()),
            });
            lower = upper;
        }

        let created = self.create_children(tx, relid, bounds)?;
        let record = PathmanConfig::range(tx.database, relid, column, Some(interval.trim().to_string()), tx.xid);
        if let Err(e) = self.store().insert(record) {
            self.drop_children(&created);
            return Err(e);
        }
        self.state.invalidate_relation(tx.database, relid);
        info!(relid, column, interval, partitions = created.len(), "range partitioning created");
        Ok(created)
    }

    /// Partitions `relid` into `count` hash buckets
    pub fn create_hash_partitions(
        &self,
        tx: &Transaction,
        relid: RelationId,
        column: &str,
        count: u32,
    ) -> Result<Vec<RelationId>> {
        if count == 0 {
            return Err(PathmanError::InvalidRequest("hash partitioning needs at least one partition".to_string()));
        }
        self.guard.prevent_relation_modification(tx, relid)?;
        let _lock = self.guard.partitioned_rel_lock(tx, relid)?;
        let _edit = self.state.edit_lock();

        let meta = self.parent_meta(relid)?;
        if self.store().get(tx.database, relid)?.is_some() {
            return Err(PathmanError::AlreadyPartitioned(relid));
        }
        if meta.column_index(column).is_none() {
            return Err(PathmanError::ColumnNotFound(column.to_string()));
        }

        let bounds = (0..count).map(|bucket| BoundaryDescriptor::Hash(HashBucket { bucket, buckets: count }));
        let created = self.create_children(tx, relid, bounds)?;
        if let Err(e) = self.store().insert(PathmanConfig::hash(tx.database, relid, column, tx.xid)) {
            self.drop_children(&created);
            return Err(e);
        }
        self.state.invalidate_relation(tx.database, relid);
        info!(relid, column, partitions = count, "hash partitioning created");
        Ok(created)
    }

    /// Range relation info of `relid`, under the locks of a blocking operation
    fn locked_range_info(&self, tx: &Transaction, relid: RelationId) -> Result<Arc<PartRelationInfo>> {
        let info = self.state.relation_info(tx.database, relid)?;
        if info.range().is_none() {
            return Err(PathmanError::InvalidRequest(format!("relation {relid} is not range partitioned")));
        }
        Ok(info)
    }

    /// Adds a partition with explicit bounds `[lower, upper)`
    pub fn add_range_partition(
        &self,
        tx: &Transaction,
        relid: RelationId,
        lower: &Value,
        upper: &Value,
    ) -> Result<RelationId> {
        self.guard.prevent_relation_modification(tx, relid)?;
        let _lock = self.guard.partitioned_rel_lock(tx, relid)?;
        let _edit = self.state.edit_lock();

        let info = self.locked_range_info(tx, relid)?;
        let (lower, upper) = (info.key_of(lower)?, info.key_of(upper)?);
        self.add_range_child(tx, &info, lower, upper)
    }

    fn add_range_child(
        &self,
        tx: &Transaction,
        info: &PartRelationInfo,
        lower: Value,
        upper: Value,
    ) -> Result<RelationId> {
        let relid = info.parent;
        if let Some(directory) = info.range() {
            // Dry run: rejects overlaps and empty ranges before anything is created
            directory
                .with_entry(RangeEntry::new(INVALID_OID, lower.clone(), upper.clone()), info.comparator())
                .map_err(|e| PathmanError::InvalidRequest(e.to_string()))?;
        }

        let bound = BoundaryDescriptor::Range {
            lower: Some(lower),
            upper: Some(upper),
        };
        let partition = self.catalog().create_partition(relid, bound.clone(), tx.xid)?;
        self.state.invalidate_relation(tx.database, relid);
        info!(relid, partition, %bound, "range partition added");
        Ok(partition)
    }

    /// Adds one partition of the relation's interval after the last one
    pub fn append_range_partition(&self, tx: &Transaction, relid: RelationId) -> Result<RelationId> {
        self.guard.prevent_relation_modification(tx, relid)?;
        let _lock = self.guard.partitioned_rel_lock(tx, relid)?;
        let _edit = self.state.edit_lock();

        let info = self.locked_range_info(tx, relid)?;
        let interval = Self::interval_of(&info)?;
        let lower = info
            .range()
            .and_then(|d| d.last())
            .and_then(|e| e.upper.clone())
            .ok_or_else(|| PathmanError::InvalidRequest(format!("cannot append a partition to relation {relid}")))?;
        let upper = interval.add_to(&lower)?;
        self.add_range_child(tx, &info, lower, upper)
    }

    /// Adds one partition of the relation's interval before the first one
    pub fn prepend_range_partition(&self, tx: &Transaction, relid: RelationId) -> Result<RelationId> {
        self.guard.prevent_relation_modification(tx, relid)?;
        let _lock = self.guard.partitioned_rel_lock(tx, relid)?;
        let _edit = self.state.edit_lock();

        let info = self.locked_range_info(tx, relid)?;
        let interval = Self::interval_of(&info)?;
        let upper = info
            .range()
            .and_then(|d| d.first())
            .and_then(|e| e.lower.clone())
            .ok_or_else(|| PathmanError::InvalidRequest(format!("cannot prepend a partition to relation {relid}")))?;
        let lower = interval.subtract_from(&upper)?;
        self.add_range_child(tx, &info, lower, upper)
    }

    fn interval_of(info: &PartRelationInfo) -> Result<&RangeInterval> {
        info.interval
            .as_ref()
            .ok_or_else(|| PathmanError::InvalidRequest(format!("relation {} has no range interval", info.parent)))
    }

    /// Drops a range partition together with its rows
    pub fn drop_range_partition(&self, tx: &Transaction, partition: RelationId) -> Result<()> {
        let meta = self.catalog().relation(partition)?.ok_or(PathmanError::RelationNotFound(partition))?;
        let relid = meta
            .parent
            .ok_or_else(|| PathmanError::InvalidRequest(format!("relation \"{}\" is not a partition", meta.name)))?;

        self.guard.prevent_relation_modification(tx, relid)?;
        let _lock = self.guard.partitioned_rel_lock(tx, relid)?;
        let _edit = self.state.edit_lock();

        let info = self.locked_range_info(tx, relid)?;
        if info.range().and_then(|d| d.position(partition)).is_none() {
            return Err(PathmanError::inconsistent(relid, format!("partition {partition} is not listed")));
        }
        self.catalog().drop_relation(partition)?;
        self.state.invalidate_relation(tx.database, relid);
        info!(relid, partition, "range partition dropped");
        Ok(())
    }

    /// Removes the configuration record; partitions become ordinary tables
    pub fn disable_partitioning(&self, tx: &Transaction, relid: RelationId) -> Result<()> {
        self.guard.prevent_relation_modification(tx, relid)?;
        let _lock = self.guard.partitioned_rel_lock(tx, relid)?;
        let _edit = self.state.edit_lock();

        self.store()
            .remove(tx.database, relid)?
            .ok_or(PathmanError::NotPartitioned(relid))?;
        for child in self.catalog().children(relid)? {
            self.catalog().detach_partition(child.relid)?;
        }
        self.state.invalidate_relation(tx.database, relid);
        info!(relid, "partitioning disabled for relation");
        Ok(())
    }

    fn update_params(
        &self,
        database: DatabaseId,
        relid: RelationId,
        change: impl FnOnce(&mut ConfigParams),
    ) -> Result<()> {
        let _edit = self.state.edit_lock();
        let record = self.store().get(database, relid)?.ok_or(PathmanError::NotPartitioned(relid))?;
        let mut params = record.params;
        change(&mut params);
        self.store().update_params(database, relid, params)?;
        self.state.invalidate_relation(database, relid);
        debug!(relid, ?params, "partitioning parameters changed");
        Ok(())
    }

    pub fn set_auto(&self, database: DatabaseId, relid: RelationId, auto: bool) -> Result<()> {
        self.update_params(database, relid, |p| p.auto = auto)
    }

    pub fn set_spawn_using_bgw(&self, database: DatabaseId, relid: RelationId, spawn_using_bgw: bool) -> Result<()> {
        self.update_params(database, relid, |p| p.spawn_using_bgw = spawn_using_bgw)
    }

    pub fn set_enable_parent(&self, database: DatabaseId, relid: RelationId, enable_parent: bool) -> Result<()> {
        self.update_params(database, relid, |p| p.enable_parent = enable_parent)
    }

    /// Partitions of `relid` in directory order
    pub fn partition_list(&self, database: DatabaseId, relid: RelationId) -> Result<Vec<PartitionRow>> {
        let info = self.state.relation_info(database, relid)?;
        let bounds: Vec<(RelationId, BoundaryDescriptor)> = match info.directory() {
            Directory::Range(directory) => directory
                .entries()
                .iter()
                .map(|e| {
                    let bound = BoundaryDescriptor::Range {
                        lower: e.lower.clone(),
                        upper: e.upper.clone(),
                    };
                    (e.partition, bound)
                })
                .collect(),
            Directory::Hash(directory) => {
                let buckets = directory.len() as u32;
                directory
                    .partitions()
                    .iter()
                    .enumerate()
                    .map(|(i, &p)| (p, BoundaryDescriptor::Hash(HashBucket { bucket: i as u32, buckets })))
                    .collect()
            }
        };

        bounds
            .into_iter()
            .map(|(partition, bound)| {
                let name = self
                    .catalog()
                    .relation(partition)?
                    .map_or_else(|| partition.to_string(), |m| m.name);
                Ok(PartitionRow {
                    parent: relid,
                    partition,
                    name,
                    bound,
                })
            })
            .collect()
    }
}
