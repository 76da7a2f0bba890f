//! Table-level lock manager
//!
//! Eight lock modes with the usual host conflict matrix. Locks are counted per
//! transaction: acquiring a mode the transaction already holds bumps a counter
//! and reports `AlreadyHeld`, and each acquisition needs its own release.
//! A transaction never conflicts with its own locks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::core::{DatabaseId, PathmanError, RelationId, Result, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    AccessShare,
    RowShare,
    RowExclusive,
    ShareUpdateExclusive,
    Share,
    ShareRowExclusive,
    Exclusive,
    AccessExclusive,
}

impl LockMode {
    pub const ALL: [Self; 8] = [
        Self::AccessShare,
        Self::RowShare,
        Self::RowExclusive,
        Self::ShareUpdateExclusive,
        Self::Share,
        Self::ShareRowExclusive,
        Self::Exclusive,
        Self::AccessExclusive,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AccessShare => "AccessShareLock",
            Self::RowShare => "RowShareLock",
            Self::RowExclusive => "RowExclusiveLock",
            Self::ShareUpdateExclusive => "ShareUpdateExclusiveLock",
            Self::Share => "ShareLock",
            Self::ShareRowExclusive => "ShareRowExclusiveLock",
            Self::Exclusive => "ExclusiveLock",
            Self::AccessExclusive => "AccessExclusiveLock",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Modes that conflict with `self`, as a bit set
    const fn conflicts(self) -> u8 {
        use LockMode::*;
        match self {
            AccessShare => AccessExclusive.bit(),
            RowShare => Exclusive.bit() | AccessExclusive.bit(),
            RowExclusive => Share.bit() | ShareRowExclusive.bit() | Exclusive.bit() | AccessExclusive.bit(),
            ShareUpdateExclusive => {
                ShareUpdateExclusive.bit()
                    | Share.bit()
                    | ShareRowExclusive.bit()
                    | Exclusive.bit()
                    | AccessExclusive.bit()
            }
            Share => {
                RowExclusive.bit()
                    | ShareUpdateExclusive.bit()
                    | ShareRowExclusive.bit()
                    | Exclusive.bit()
                    | AccessExclusive.bit()
            }
            ShareRowExclusive => {
                RowExclusive.bit()
                    | ShareUpdateExclusive.bit()
                    | Share.bit()
                    | ShareRowExclusive.bit()
                    | Exclusive.bit()
                    | AccessExclusive.bit()
            }
            Exclusive => !(AccessShare.bit()),
            AccessExclusive => u8::MAX,
        }
    }

    #[must_use]
    pub const fn conflicts_with(self, other: Self) -> bool {
        self.conflicts() & other.bit() != 0
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lockable object: a relation of a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockTag {
    pub database: DatabaseId,
    pub relation: RelationId,
}

impl LockTag {
    #[must_use]
    pub const fn relation(database: DatabaseId, relation: RelationId) -> Self {
        Self { database, relation }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquireResult {
    /// Newly granted
    Acquired,
    /// The transaction held this mode already; its count was incremented
    AlreadyHeld,
    /// Conditional request could not be granted
    NotAvailable,
}

/// Lock manager of the host engine
pub trait LockManager: Send + Sync {
    /// Acquires `mode` on `tag` for `xid`.
    ///
    /// With `dont_wait` a conflicting request returns `NotAvailable`, otherwise
    /// it waits up to the manager's timeout and fails with `LockTimeout`.
    fn acquire(&self, xid: TransactionId, tag: LockTag, mode: LockMode, dont_wait: bool) -> Result<LockAcquireResult>;

    /// Drops one acquisition; returns `false` if none was held
    fn release(&self, xid: TransactionId, tag: LockTag, mode: LockMode) -> bool;

    /// Drops every lock of `xid`, at commit or rollback
    fn release_all(&self, xid: TransactionId);

    /// How many times `xid` holds `mode` on `tag`.
    /// `None` when the manager cannot answer without side effects.
    fn held_count(&self, _xid: TransactionId, _tag: LockTag, _mode: LockMode) -> Option<u32> {
        None
    }
}

#[derive(Debug, Default)]
struct LockTable {
    holders: HashMap<LockTag, HashMap<(TransactionId, LockMode), u32>>,
}

impl LockTable {
    fn count(&self, xid: TransactionId, tag: LockTag, mode: LockMode) -> u32 {
        self.holders
            .get(&tag)
            .and_then(|h| h.get(&(xid, mode)))
            .copied()
            .unwrap_or(0)
    }

    fn conflicting(&self, xid: TransactionId, tag: LockTag, mode: LockMode) -> Option<(TransactionId, LockMode)> {
        self.holders.get(&tag).and_then(|h| {
            h.keys()
                .find(|(holder, held)| *holder != xid && mode.conflicts_with(*held))
                .copied()
        })
    }

    fn grant(&mut self, xid: TransactionId, tag: LockTag, mode: LockMode) {
        *self.holders.entry(tag).or_default().entry((xid, mode)).or_insert(0) += 1;
    }
}

/// In-process lock manager built on `parking_lot`
#[derive(Debug)]
pub struct HostLockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    timeout: Duration,
    introspection: bool,
}

impl HostLockManager {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            timeout,
            introspection: true,
        }
    }

    /// Manager that does not answer `held_count`, forcing callers to probe
    #[must_use]
    pub fn without_introspection(mut self) -> Self {
        self.introspection = false;
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl LockManager for HostLockManager {
    fn acquire(&self, xid: TransactionId, tag: LockTag, mode: LockMode, dont_wait: bool) -> Result<LockAcquireResult> {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();

        if table.count(xid, tag, mode) > 0 {
            table.grant(xid, tag, mode);
            return Ok(LockAcquireResult::AlreadyHeld);
        }

        while let Some((holder, held)) = table.conflicting(xid, tag, mode) {
            if dont_wait {
                return Ok(LockAcquireResult::NotAvailable);
            }
            trace!(xid, relation = tag.relation, %mode, holder, %held, "waiting for lock");
            if self.released.wait_until(&mut table, deadline).timed_out()
                && table.conflicting(xid, tag, mode).is_some()
            {
                warn!(xid, relation = tag.relation, %mode, "lock timeout");
                return Err(PathmanError::LockTimeout {
                    relation: tag.relation,
                    mode: mode.name(),
                });
            }
        }

        table.grant(xid, tag, mode);
        Ok(LockAcquireResult::Acquired)
    }

    fn release(&self, xid: TransactionId, tag: LockTag, mode: LockMode) -> bool {
        let mut table = self.table.lock();
        let Some(holders) = table.holders.get_mut(&tag) else {
            return false;
        };
        let Some(count) = holders.get_mut(&(xid, mode)) else {
            return false;
        };

        *count -= 1;
        if *count == 0 {
            holders.remove(&(xid, mode));
            if holders.is_empty() {
                table.holders.remove(&tag);
            }
            self.released.notify_all();
        }
        true
    }

    fn release_all(&self, xid: TransactionId) {
        let mut table = self.table.lock();
        for holders in table.holders.values_mut() {
            holders.retain(|(holder, _), _| *holder != xid);
        }
        table.holders.retain(|_, h| !h.is_empty());
        self.released.notify_all();
    }

    fn held_count(&self, xid: TransactionId, tag: LockTag, mode: LockMode) -> Option<u32> {
        self.introspection.then(|| self.table.lock().count(xid, tag, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const TAG: LockTag = LockTag::relation(1, 100);

    fn manager() -> HostLockManager {
        HostLockManager::new(Duration::from_millis(200))
    }

    #[test]
    fn test_conflict_matrix_is_symmetric() {
        for a in LockMode::ALL {
            for b in LockMode::ALL {
                assert_eq!(a.conflicts_with(b), b.conflicts_with(a), "{a} vs {b}");
            }
        }
        assert!(LockMode::ShareUpdateExclusive.conflicts_with(LockMode::ShareUpdateExclusive));
        assert!(!LockMode::RowExclusive.conflicts_with(LockMode::RowExclusive));
        assert!(LockMode::Exclusive.conflicts_with(LockMode::RowExclusive));
        assert!(!LockMode::Exclusive.conflicts_with(LockMode::AccessShare));
    }

    #[test]
    fn test_reacquire_reports_already_held() {
        let locks = manager();
        assert_eq!(locks.acquire(1, TAG, LockMode::Share, false).unwrap(), LockAcquireResult::Acquired);
        assert_eq!(locks.acquire(1, TAG, LockMode::Share, false).unwrap(), LockAcquireResult::AlreadyHeld);
        assert_eq!(locks.held_count(1, TAG, LockMode::Share), Some(2));

        assert!(locks.release(1, TAG, LockMode::Share));
        assert_eq!(locks.held_count(1, TAG, LockMode::Share), Some(1));
        assert!(locks.release(1, TAG, LockMode::Share));
        assert!(!locks.release(1, TAG, LockMode::Share));
    }

    #[test]
    fn test_own_locks_never_conflict() {
        let locks = manager();
        locks.acquire(1, TAG, LockMode::RowExclusive, false).unwrap();
        assert_eq!(
            locks.acquire(1, TAG, LockMode::AccessExclusive, true).unwrap(),
            LockAcquireResult::Acquired
        );
        assert_eq!(
            locks.acquire(2, TAG, LockMode::AccessShare, true).unwrap(),
            LockAcquireResult::NotAvailable
        );
    }

    #[test]
    fn test_blocking_acquire_times_out() {
        let locks = manager();
        locks.acquire(1, TAG, LockMode::ShareUpdateExclusive, false).unwrap();
        let err = locks.acquire(2, TAG, LockMode::ShareUpdateExclusive, false).unwrap_err();
        assert!(matches!(err, PathmanError::LockTimeout { relation: 100, .. }));
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let locks = Arc::new(HostLockManager::new(Duration::from_secs(5)));
        locks.acquire(1, TAG, LockMode::Exclusive, false).unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.acquire(2, TAG, LockMode::Share, false))
        };
        thread::sleep(Duration::from_millis(50));
        locks.release_all(1);

        assert_eq!(waiter.join().unwrap().unwrap(), LockAcquireResult::Acquired);
    }

    #[test]
    fn test_without_introspection() {
        let locks = manager().without_introspection();
        locks.acquire(1, TAG, LockMode::Share, false).unwrap();
        assert_eq!(locks.held_count(1, TAG, LockMode::Share), None);
    }
}
