//! Lock/transaction guard used by partition management and creation
//!
//! Wraps the host lock manager with the lock tiers partitioning needs:
//! - `ShareUpdateExclusive` on the parent serializes structural edits while
//!   leaving reads and row modifications alone
//! - `Share` freezes the parent's data
//! - `Exclusive` probes for concurrent writers

use std::sync::Arc;

use tracing::{debug, trace};

use crate::core::{PathmanError, RelationId, Result};
use super::lock::{LockAcquireResult, LockManager, LockMode, LockTag};
use super::manager::Transaction;

/// Lock tier of structural edits
pub const PARTITIONED_REL_LOCK: LockMode = LockMode::ShareUpdateExclusive;

/// Lock tier that blocks row modification
pub const REL_DATA_LOCK: LockMode = LockMode::Share;

#[derive(Clone)]
pub struct XactGuard {
    locks: Arc<dyn LockManager>,
}

impl std::fmt::Debug for XactGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XactGuard").finish_non_exhaustive()
    }
}

/// A lock released when dropped, unless the transaction ends first
#[must_use = "the lock is released as soon as the handle is dropped"]
pub struct RelationLock<'g> {
    guard: &'g XactGuard,
    xid: u64,
    tag: LockTag,
    mode: LockMode,
}

impl RelationLock<'_> {
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for RelationLock<'_> {
    fn drop(&mut self) {
        self.guard.locks.release(self.xid, self.tag, self.mode);
    }
}

impl XactGuard {
    #[must_use]
    pub fn new(locks: Arc<dyn LockManager>) -> Self {
        Self { locks }
    }

    fn tag(tx: &Transaction, relid: RelationId) -> LockTag {
        LockTag::relation(tx.database, relid)
    }

    /// Blocks until `mode` is granted or the lock timeout expires
    pub fn lock(&self, tx: &Transaction, relid: RelationId, mode: LockMode) -> Result<()> {
        self.locks.acquire(tx.xid, Self::tag(tx, relid), mode, false)?;
        trace!(xid = tx.xid, relid, %mode, "locked");
        Ok(())
    }

    pub fn unlock(&self, tx: &Transaction, relid: RelationId, mode: LockMode) {
        self.locks.release(tx.xid, Self::tag(tx, relid), mode);
    }

    /// Takes the structural-edit lock of a partitioned relation
    pub fn lock_partitioned_rel(&self, tx: &Transaction, relid: RelationId) -> Result<()> {
        self.lock(tx, relid, PARTITIONED_REL_LOCK)
    }

    pub fn unlock_partitioned_rel(&self, tx: &Transaction, relid: RelationId) {
        self.unlock(tx, relid, PARTITIONED_REL_LOCK);
    }

    /// Structural-edit lock released at the end of the returned handle's scope
    pub fn partitioned_rel_lock(&self, tx: &Transaction, relid: RelationId) -> Result<RelationLock<'_>> {
        self.lock_partitioned_rel(tx, relid)?;
        Ok(RelationLock {
            guard: self,
            xid: tx.xid,
            tag: Self::tag(tx, relid),
            mode: PARTITIONED_REL_LOCK,
        })
    }

    /// Blocks row modification of `relid` while allowing reads
    pub fn lock_rel_data(&self, tx: &Transaction, relid: RelationId) -> Result<()> {
        self.lock(tx, relid, REL_DATA_LOCK)
    }

    pub fn unlock_rel_data(&self, tx: &Transaction, relid: RelationId) {
        self.unlock(tx, relid, REL_DATA_LOCK);
    }

    /// Does the transaction currently hold `mode` on `relid`?
    ///
    /// Asks the lock manager when it keeps per-transaction counts. Otherwise
    /// probes with a conditional acquisition and undoes it: `AlreadyHeld`
    /// proves an earlier hold (the extra count is given back), a fresh grant
    /// proves there was none.
    pub fn holds_lock(&self, tx: &Transaction, relid: RelationId, mode: LockMode) -> Result<bool> {
        let tag = Self::tag(tx, relid);
        if let Some(count) = self.locks.held_count(tx.xid, tag, mode) {
            return Ok(count > 0);
        }

        match self.locks.acquire(tx.xid, tag, mode, true)? {
            LockAcquireResult::AlreadyHeld => {
                self.locks.release(tx.xid, tag, mode);
                Ok(true)
            }
            LockAcquireResult::Acquired => {
                self.locks.release(tx.xid, tag, mode);
                Ok(false)
            }
            // Someone else holds a conflicting mode, so we cannot hold this one
            LockAcquireResult::NotAvailable => Ok(false),
        }
    }

    /// Would a background worker block on a lock this transaction holds?
    ///
    /// Checks every mode from the structural-edit tier upwards.
    pub fn bgw_conflicting_lock_exists(&self, tx: &Transaction, relid: RelationId) -> Result<bool> {
        for mode in LockMode::ALL.into_iter().filter(|m| *m >= PARTITIONED_REL_LOCK) {
            if self.holds_lock(tx, relid, mode)? {
                trace!(xid = tx.xid, relid, %mode, "caller holds a lock a worker would wait for");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Is another transaction modifying `relid` right now?
    pub fn is_table_being_modified(&self, tx: &Transaction, relid: RelationId) -> Result<bool> {
        let tag = Self::tag(tx, relid);
        match self.locks.acquire(tx.xid, tag, LockMode::Exclusive, true)? {
            LockAcquireResult::NotAvailable => Ok(true),
            LockAcquireResult::Acquired | LockAcquireResult::AlreadyHeld => {
                self.locks.release(tx.xid, tag, LockMode::Exclusive);
                Ok(false)
            }
        }
    }

    #[must_use]
    pub fn is_level_read_committed(&self, tx: &Transaction) -> bool {
        tx.is_read_committed()
    }

    /// Guards a blocking partitioning operation on `relid`.
    ///
    /// Requires READ COMMITTED, then takes `Exclusive` without waiting and keeps
    /// it until the transaction ends, so no insert can race the operation.
    pub fn prevent_relation_modification(&self, tx: &Transaction, relid: RelationId) -> Result<()> {
        if !self.is_level_read_committed(tx) {
            return Err(PathmanError::InvalidRequest(format!(
                "cannot perform blocking partitioning operation in {} transaction, use READ COMMITTED",
                tx.isolation.as_str()
            )));
        }

        let tag = Self::tag(tx, relid);
        match self.locks.acquire(tx.xid, tag, LockMode::Exclusive, true)? {
            LockAcquireResult::NotAvailable => {
                debug!(xid = tx.xid, relid, "relation is being modified concurrently");
                Err(PathmanError::InvalidRequest(format!(
                    "relation {relid} is being modified concurrently"
                )))
            }
            LockAcquireResult::Acquired | LockAcquireResult::AlreadyHeld => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{GlobalTransactionManager, HostLockManager, IsolationLevel};
    use std::time::Duration;

    const REL: RelationId = 100;

    fn setup(introspection: bool) -> (GlobalTransactionManager, XactGuard) {
        let locks = HostLockManager::new(Duration::from_millis(100));
        let locks: Arc<dyn LockManager> = if introspection {
            Arc::new(locks)
        } else {
            Arc::new(locks.without_introspection())
        };
        (GlobalTransactionManager::new(Arc::clone(&locks)), XactGuard::new(locks))
    }

    #[test]
    fn test_holds_lock_with_and_without_introspection() {
        for introspection in [true, false] {
            let (gtm, guard) = setup(introspection);
            let tx = gtm.begin(1, IsolationLevel::ReadCommitted);
            assert!(!guard.holds_lock(&tx, REL, LockMode::Share).unwrap());

            guard.lock_rel_data(&tx, REL).unwrap();
            assert!(guard.holds_lock(&tx, REL, LockMode::Share).unwrap());
            // Probing must not change the count
            assert!(guard.holds_lock(&tx, REL, LockMode::Share).unwrap());
            guard.unlock_rel_data(&tx, REL);
            assert!(!guard.holds_lock(&tx, REL, LockMode::Share).unwrap());
        }
    }

    #[test]
    fn test_conditional_acquire_restores_original_count() {
        let (gtm, guard) = setup(false);
        let tx = gtm.begin(1, IsolationLevel::ReadCommitted);
        guard.lock(&tx, REL, LockMode::Share).unwrap();
        guard.lock(&tx, REL, LockMode::Share).unwrap();
        assert!(guard.holds_lock(&tx, REL, LockMode::Share).unwrap());
        guard.unlock(&tx, REL, LockMode::Share);
        assert!(guard.holds_lock(&tx, REL, LockMode::Share).unwrap());
        guard.unlock(&tx, REL, LockMode::Share);
        assert!(!guard.holds_lock(&tx, REL, LockMode::Share).unwrap());
    }

    #[test]
    fn test_bgw_conflicting_lock() {
        let (gtm, guard) = setup(false);
        let tx = gtm.begin(1, IsolationLevel::ReadCommitted);

        guard.lock(&tx, REL, LockMode::RowExclusive).unwrap();
        assert!(!guard.bgw_conflicting_lock_exists(&tx, REL).unwrap());

        guard.lock_partitioned_rel(&tx, REL).unwrap();
        assert!(guard.bgw_conflicting_lock_exists(&tx, REL).unwrap());
        guard.unlock_partitioned_rel(&tx, REL);
        assert!(!guard.bgw_conflicting_lock_exists(&tx, REL).unwrap());

        guard.lock(&tx, REL, LockMode::AccessExclusive).unwrap();
        assert!(guard.bgw_conflicting_lock_exists(&tx, REL).unwrap());
    }

    #[test]
    fn test_partitioned_rel_lock_handle() {
        let (gtm, guard) = setup(true);
        let t1 = gtm.begin(1, IsolationLevel::ReadCommitted);
        let t2 = gtm.begin(1, IsolationLevel::ReadCommitted);
        {
            let _handle = guard.partitioned_rel_lock(&t1, REL).unwrap();
            assert!(matches!(
                guard.lock_partitioned_rel(&t2, REL),
                Err(PathmanError::LockTimeout { .. })
            ));
        }
        guard.lock_partitioned_rel(&t2, REL).unwrap();
    }

    #[test]
    fn test_concurrent_modification() {
        let (gtm, guard) = setup(true);
        let writer = gtm.begin(1, IsolationLevel::ReadCommitted);
        let admin = gtm.begin(1, IsolationLevel::ReadCommitted);

        assert!(!guard.is_table_being_modified(&admin, REL).unwrap());
        guard.lock(&writer, REL, LockMode::RowExclusive).unwrap();
        assert!(guard.is_table_being_modified(&admin, REL).unwrap());
        assert!(guard.prevent_relation_modification(&admin, REL).is_err());

        gtm.commit(&writer);
        guard.prevent_relation_modification(&admin, REL).unwrap();
        // The exclusive lock stays until the transaction ends
        let late_writer = gtm.begin(1, IsolationLevel::ReadCommitted);
        assert!(guard.lock(&late_writer, REL, LockMode::RowExclusive).is_err());
        gtm.commit(&admin);
        guard.lock(&late_writer, REL, LockMode::RowExclusive).unwrap();
    }

    #[test]
    fn test_blocking_operations_need_read_committed() {
        let (gtm, guard) = setup(true);
        let tx = gtm.begin(1, IsolationLevel::RepeatableRead);
        assert!(!guard.is_level_read_committed(&tx));
        assert!(matches!(
            guard.prevent_relation_modification(&tx, REL),
            Err(PathmanError::InvalidRequest(_))
        ));
    }
}
