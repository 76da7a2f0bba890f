//! Creation state machine
//!
//! `Requested -> LockCheck -> {InlineCreate | DelegatedCreate} -> Installed | Failed`
//!
//! Inline creation runs in the caller's transaction under the structural-edit
//! lock. Delegated creation hands the request to a background worker running
//! its own transaction, for callers that must not wait on their own locks.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::cache::{CacheLookup, PathmanState};
use crate::catalog::BoundaryDescriptor;
use crate::core::{PathmanError, RelationId, Result, TransactionId, Value};
use crate::partition::{PartRelationInfo, RangeEntry, SearchResult};
use crate::settings::PathmanSettings;
use crate::transaction::{GlobalTransactionManager, IsolationLevel, Transaction, XactGuard};
use super::spawn::plan_spawn;
use super::worker::{BgWorkerPool, CreationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationState {
    Requested,
    LockCheck,
    InlineCreate,
    DelegatedCreate,
    Installed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationOutcome {
    /// `partition` covers the value
    Installed {
        partition: RelationId,
        /// `false` when a concurrent creator got there first
        newly_created: bool,
        created_by: TransactionId,
    },
    /// Partitioning was disabled while the request ran
    Abandoned,
}

/// Creates partitions inside a given transaction
#[derive(Clone)]
pub(crate) struct InlineCreator {
    state: Arc<PathmanState>,
    gtm: GlobalTransactionManager,
    guard: XactGuard,
    max_spawned: usize,
}

impl InlineCreator {
    /// Runs a delegated request in a fresh READ COMMITTED transaction
    pub(crate) fn run_request(&self, request: &CreationRequest) -> Result<CreationOutcome> {
        let tx = self.gtm.begin(request.database, IsolationLevel::ReadCommitted);
        debug!(xid = tx.xid, relid = request.relid, value = %request.value, "worker picked up creation request");

        match self.create(&tx, request.relid, &request.value) {
            Ok(outcome) => {
                self.gtm.commit(&tx);
                Ok(outcome)
            }
            Err(e) => {
                self.gtm.rollback(&tx);
                Err(e)
            }
        }
    }

    pub(crate) fn create(&self, tx: &Transaction, relid: RelationId, value: &Value) -> Result<CreationOutcome> {
        let _relation_lock = self.guard.partitioned_rel_lock(tx, relid)?;
        let _edit = self.state.edit_lock();

        // Re-check under the lock: someone may have created it meanwhile
        let info = match self.state.lookup(tx.database, relid)? {
            CacheLookup::Found(info) => info,
            CacheLookup::NotReady => return Ok(CreationOutcome::Abandoned),
            CacheLookup::NotPartitioned => return Err(PathmanError::NotPartitioned(relid)),
        };
        let Some(directory) = info.range() else {
            return Err(PathmanError::InvalidRequest(format!(
                "relation {relid} is hash partitioned, its partitions are never created on demand"
            )));
        };
        let key = info.key_of(value)?;
        let cmp = info.comparator();

        if let SearchResult::Found(i) = directory.locate(&key, cmp)? {
            let entry = &directory.entries()[i];
            return covered_by(tx, relid, entry.partition, entry.created_by);
        }

        let interval = info.interval.as_ref().ok_or_else(|| {
            PathmanError::CreationFailure(format!("relation {relid} has no range interval"))
        })?;
        let bounds = plan_spawn(directory, interval, &key, cmp, self.max_spawned)?;

        let mut created = Vec::with_capacity(bounds.len());
        let mut next = directory.clone();
        for (lower, upper) in bounds {
            let bound = BoundaryDescriptor::Range {
                lower: Some(lower.clone()),
                upper: Some(upper.clone()),
            };
            let step = self
                .state
                .catalog()
                .create_partition(relid, bound, tx.xid)
                .and_then(|partition| {
                    created.push(partition);
                    next.with_entry(RangeEntry::new(partition, lower, upper).created_by(tx.xid), cmp)
                });
            match step {
                Ok(directory) => next = directory,
                Err(e) => {
                    error!(relid, error = %e, "partition creation failed");
                    self.drop_created(&created);
                    return Err(e);
                }
            }
        }

        let Some(&partition) = created.last() else {
            return Err(PathmanError::CreationFailure(format!("no partition planned for {key}")));
        };
        if !self.state.install(info.with_range_directory(next)) {
            warn!(relid, "partitioning disabled during creation, abandoning request");
            self.drop_created(&created);
            return Ok(CreationOutcome::Abandoned);
        }
        info!(xid = tx.xid, relid, partition, count = created.len(), "created partitions");

        Ok(CreationOutcome::Installed {
            partition,
            newly_created: true,
            created_by: tx.xid,
        })
    }

    /// Compensation for a half-finished request
    fn drop_created(&self, created: &[RelationId]) {
        for &partition in created.iter().rev() {
            if let Err(e) = self.state.catalog().drop_relation(partition) {
                error!(partition, error = %e, "could not drop partition of a failed request");
            }
        }
    }
}

/// An existing partition covers the value; strict isolation levels must see its creator
fn covered_by(
    tx: &Transaction,
    relid: RelationId,
    partition: RelationId,
    created_by: TransactionId,
) -> Result<CreationOutcome> {
    if !tx.is_read_committed() && !tx.sees(created_by) {
        warn!(xid = tx.xid, relid, partition, created_by, "partition created by a concurrent transaction");
        return Err(PathmanError::SerializationConflict(format!(
            "partition {partition} of relation {relid} was created concurrently, retry the transaction"
        )));
    }
    Ok(CreationOutcome::Installed {
        partition,
        newly_created: false,
        created_by,
    })
}

pub struct CreationOrchestrator {
    creator: InlineCreator,
    workers: Option<BgWorkerPool>,
}

impl std::fmt::Debug for CreationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreationOrchestrator")
            .field("max_spawned", &self.creator.max_spawned)
            .field("workers", &self.workers.is_some())
            .finish()
    }
}

impl CreationOrchestrator {
    /// Starts the worker pool unless `spawn_using_bgw` is off
    pub fn new(
        state: Arc<PathmanState>,
        gtm: GlobalTransactionManager,
        guard: XactGuard,
        settings: &PathmanSettings,
    ) -> Result<Self> {
        let creator = InlineCreator {
            state,
            gtm,
            guard,
            max_spawned: settings.max_spawned_partitions,
        };
        let workers = if settings.spawn_using_bgw {
            Some(BgWorkerPool::start(
                creator.clone(),
                settings.worker_threads,
                settings.worker_timeout(),
            )?)
        } else {
            None
        };
        Ok(Self { creator, workers })
    }

    #[must_use]
    pub const fn has_workers(&self) -> bool {
        self.workers.is_some()
    }

    fn transition(relid: RelationId, xid: TransactionId, state: CreationState) {
        debug!(relid, xid, ?state, "creation state");
    }

    /// Makes sure a partition covering `value` exists and returns it
    pub fn create_partition_for_value(
        &self,
        tx: &Transaction,
        relid: RelationId,
        value: &Value,
    ) -> Result<CreationOutcome> {
        Self::transition(relid, tx.xid, CreationState::Requested);
        let info = match self.creator.state.lookup(tx.database, relid)? {
            CacheLookup::Found(info) => info,
            CacheLookup::NotReady => return Ok(CreationOutcome::Abandoned),
            CacheLookup::NotPartitioned => return Err(PathmanError::NotPartitioned(relid)),
        };

        Self::transition(relid, tx.xid, CreationState::LockCheck);
        let result = if self.should_delegate(tx, &info)? {
            Self::transition(relid, tx.xid, CreationState::DelegatedCreate);
            self.delegate(tx, relid, value)
        } else {
            Self::transition(relid, tx.xid, CreationState::InlineCreate);
            self.creator.create(tx, relid, value)
        };

        match &result {
            Ok(CreationOutcome::Installed { .. }) => Self::transition(relid, tx.xid, CreationState::Installed),
            Ok(CreationOutcome::Abandoned) => debug!(relid, xid = tx.xid, "creation abandoned"),
            Err(e) => {
                Self::transition(relid, tx.xid, CreationState::Failed);
                debug!(relid, xid = tx.xid, error = %e, "creation failed");
            }
        }
        result
    }

    /// Hand the request to a worker only when it cannot block on the caller.
    ///
    /// A relation partitioned by this very transaction is invisible to the
    /// worker, and a worker would wait forever on a structural-edit (or
    /// stronger) lock the caller already holds.
    fn should_delegate(&self, tx: &Transaction, info: &PartRelationInfo) -> Result<bool> {
        if self.workers.is_none() || !info.params.spawn_using_bgw || info.partitioned_by == tx.xid {
            return Ok(false);
        }
        Ok(!self.creator.guard.bgw_conflicting_lock_exists(tx, info.parent)?)
    }

    fn delegate(&self, tx: &Transaction, relid: RelationId, value: &Value) -> Result<CreationOutcome> {
        let Some(workers) = &self.workers else {
            return self.creator.create(tx, relid, value);
        };
        let outcome = workers.submit(CreationRequest {
            database: tx.database,
            relid,
            value: value.clone(),
        })?;

        match outcome {
            CreationOutcome::Installed {
                partition,
                newly_created: false,
                created_by,
            } => covered_by(tx, relid, partition, created_by),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ConfigStore, HostCatalog, InMemoryCatalog, MemoryConfigStore, PathmanConfig};
    use crate::core::{Column, DataType};
    use crate::transaction::{HostLockManager, LockManager, LockMode};
    use std::time::Duration;

    struct Fixture {
        catalog: Arc<InMemoryCatalog>,
        state: Arc<PathmanState>,
        gtm: GlobalTransactionManager,
        orchestrator: CreationOrchestrator,
        parent: RelationId,
    }

    fn fixture(spawn_using_bgw: bool) -> Fixture {
        let catalog = Arc::new(InMemoryCatalog::new());
        let store = Arc::new(MemoryConfigStore::new());
        let parent = catalog
            .create_table(1, "events", vec![Column::new("id", DataType::Integer, false)])
            .unwrap();
        for lo in [1, 11] {
            let bound = BoundaryDescriptor::Range {
                lower: Some(Value::Integer(lo)),
                upper: Some(Value::Integer(lo + 10)),
            };
            catalog.create_partition(parent, bound, 0).unwrap();
        }
        store
            .insert(PathmanConfig::range(1, parent, "id", Some("10".to_string()), 0))
            .unwrap();

        let locks: Arc<dyn LockManager> = Arc::new(HostLockManager::new(Duration::from_secs(2)));
        let gtm = GlobalTransactionManager::new(Arc::clone(&locks));
        let guard = XactGuard::new(locks);
        let state = Arc::new(PathmanState::new(store, catalog.clone(), true));
        let settings = PathmanSettings {
            spawn_using_bgw,
            ..PathmanSettings::default()
        };
        let orchestrator = CreationOrchestrator::new(Arc::clone(&state), gtm.clone(), guard, &settings).unwrap();
        Fixture {
            catalog,
            state,
            gtm,
            orchestrator,
            parent,
        }
    }

    fn installed(outcome: &CreationOutcome) -> (RelationId, bool) {
        match outcome {
            CreationOutcome::Installed {
                partition,
                newly_created,
                ..
            } => (*partition, *newly_created),
            CreationOutcome::Abandoned => panic!("request was abandoned"),
        }
    }

    #[test_log::test]
    fn test_inline_creation_chains_partitions() {
        let f = fixture(false);
        let tx = f.gtm.begin(1, IsolationLevel::ReadCommitted);
        let outcome = f.orchestrator.create_partition_for_value(&tx, f.parent, &Value::Integer(35)).unwrap();
        let (partition, newly_created) = installed(&outcome);
        assert!(newly_created);

        let info = f.state.relation_info(1, f.parent).unwrap();
        assert_eq!(info.children_count(), 4);
        assert_eq!(info.child(3), Some(partition));
        assert_eq!(info.locate(&Value::Integer(35)).unwrap(), SearchResult::Found(3));

        // A second request finds the partition
        let again = f.orchestrator.create_partition_for_value(&tx, f.parent, &Value::Integer(33)).unwrap();
        assert_eq!(installed(&again), (partition, false));
    }

    #[test_log::test]
    fn test_delegated_creation() {
        let f = fixture(true);
        assert!(f.orchestrator.has_workers());
        let tx = f.gtm.begin(1, IsolationLevel::ReadCommitted);
        f.gtm
            .lock_manager()
            .acquire(tx.xid, crate::transaction::LockTag::relation(1, f.parent), LockMode::RowExclusive, false)
            .unwrap();

        let outcome = f.orchestrator.create_partition_for_value(&tx, f.parent, &Value::Integer(-5)).unwrap();
        let (partition, newly_created) = installed(&outcome);
        assert!(newly_created);

        let meta = f.catalog.relation(partition).unwrap().unwrap();
        // Created by the worker's own transaction
        assert_ne!(meta.created_by, tx.xid);
        assert_eq!(f.state.relation_info(1, f.parent).unwrap().children_count(), 3);
    }

    #[test]
    fn test_caller_holding_edit_lock_creates_inline() {
        let f = fixture(true);
        let tx = f.gtm.begin(1, IsolationLevel::ReadCommitted);
        f.gtm
            .lock_manager()
            .acquire(tx.xid, crate::transaction::LockTag::relation(1, f.parent), LockMode::ShareUpdateExclusive, false)
            .unwrap();

        let outcome = f.orchestrator.create_partition_for_value(&tx, f.parent, &Value::Integer(25)).unwrap();
        let (partition, _) = installed(&outcome);
        assert_eq!(f.catalog.relation(partition).unwrap().unwrap().created_by, tx.xid);
    }

    #[test]
    fn test_failure_leaves_directory_untouched() {
        let f = fixture(false);
        let tx = f.gtm.begin(1, IsolationLevel::ReadCommitted);
        f.catalog.fail_creations_after(1);

        let result = f.orchestrator.create_partition_for_value(&tx, f.parent, &Value::Integer(45));
        assert!(matches!(result, Err(PathmanError::CreationFailure(_))));
        assert_eq!(f.catalog.children(f.parent).unwrap().len(), 2);
        assert_eq!(f.state.relation_info(1, f.parent).unwrap().children_count(), 2);
    }

    #[test]
    fn test_repeatable_read_sees_concurrent_partition_as_conflict() {
        let f = fixture(false);
        let reader = f.gtm.begin(1, IsolationLevel::RepeatableRead);

        let writer = f.gtm.begin(1, IsolationLevel::ReadCommitted);
        f.orchestrator.create_partition_for_value(&writer, f.parent, &Value::Integer(25)).unwrap();
        f.gtm.commit(&writer);

        let result = f.orchestrator.create_partition_for_value(&reader, f.parent, &Value::Integer(25));
        assert!(matches!(result, Err(PathmanError::SerializationConflict(_))));

        let late = f.gtm.begin(1, IsolationLevel::RepeatableRead);
        let outcome = f.orchestrator.create_partition_for_value(&late, f.parent, &Value::Integer(25)).unwrap();
        assert!(!installed(&outcome).1);
    }

    #[test]
    fn test_disabled_is_abandoned() {
        let f = fixture(false);
        f.state.set_enabled(false);
        let tx = f.gtm.begin(1, IsolationLevel::ReadCommitted);
        let outcome = f.orchestrator.create_partition_for_value(&tx, f.parent, &Value::Integer(25)).unwrap();
        assert_eq!(outcome, CreationOutcome::Abandoned);
        assert_eq!(f.catalog.children(f.parent).unwrap().len(), 2);
    }

    #[test_log::test]
    fn test_disabled_during_creation_is_abandoned() {
        let f = fixture(false);
        f.catalog.set_create_delay(Some(Duration::from_millis(300)));
        let state = Arc::clone(&f.state);
        let disabler = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            state.set_enabled(false);
        });

        let tx = f.gtm.begin(1, IsolationLevel::ReadCommitted);
        let outcome = f.orchestrator.create_partition_for_value(&tx, f.parent, &Value::Integer(25)).unwrap();
        disabler.join().unwrap();
        assert_eq!(outcome, CreationOutcome::Abandoned);
        assert_eq!(f.catalog.children(f.parent).unwrap().len(), 2);
    }

    #[test]
    fn test_hash_relations_reject_creation() {
        let f = fixture(false);
        let other = f
            .catalog
            .create_table(1, "buckets", vec![Column::new("id", DataType::Integer, false)])
            .unwrap();
        let bound = BoundaryDescriptor::Hash(crate::partition::HashBucket { bucket: 0, buckets: 1 });
        f.catalog.create_partition(other, bound, 0).unwrap();
        f.state.store().insert(PathmanConfig::hash(1, other, "id", 0)).unwrap();

        let tx = f.gtm.begin(1, IsolationLevel::ReadCommitted);
        let result = f.orchestrator.create_partition_for_value(&tx, other, &Value::Integer(1));
        assert!(matches!(result, Err(PathmanError::InvalidRequest(_))));
    }
}
