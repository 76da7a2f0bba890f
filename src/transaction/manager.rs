use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::core::{DatabaseId, TransactionId};
use super::lock::LockManager;

/// Snapshot of the transactions in progress at some instant
///
/// Work of a transaction is visible to the snapshot when the transaction
/// finished before the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Oldest active transaction ID when snapshot was taken
    /// Transactions with ID < xmin are guaranteed committed
    pub xmin: TransactionId,

    /// Next transaction ID when snapshot was taken
    /// Transactions with ID >= xmax are invisible to this snapshot
    pub xmax: TransactionId,

    /// Transactions in progress at snapshot time
    pub active_txs: Vec<TransactionId>,
}

impl Snapshot {
    #[must_use]
    pub const fn new(xmin: TransactionId, xmax: TransactionId, active_txs: Vec<TransactionId>) -> Self {
        Self { xmin, xmax, active_txs }
    }

    /// Are the effects of `xid` visible? Id 0 is bootstrap data and always visible.
    #[must_use]
    pub fn is_visible(&self, xid: TransactionId) -> bool {
        if xid < self.xmin {
            return true;
        }
        if xid >= self.xmax {
            return false;
        }
        !self.active_txs.contains(&xid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// A running transaction of one backend
#[derive(Debug, Clone)]
pub struct Transaction {
    pub xid: TransactionId,
    pub database: DatabaseId,
    pub isolation: IsolationLevel,
    /// Transaction snapshot, taken at begin
    pub snapshot: Snapshot,
}

impl Transaction {
    #[must_use]
    pub fn is_read_committed(&self) -> bool {
        self.isolation <= IsolationLevel::ReadCommitted
    }

    /// Does this transaction see the work of `xid`?
    ///
    /// Only meaningful for REPEATABLE READ and stricter; READ COMMITTED
    /// statements take a fresh snapshot each time.
    #[must_use]
    pub fn sees(&self, xid: TransactionId) -> bool {
        xid == self.xid || self.snapshot.is_visible(xid)
    }
}

/// Global transaction manager shared across all connections
///
/// Provides:
/// - Atomic transaction ID generation
/// - Active transaction tracking for snapshots
/// - Release of every lock a transaction holds when it ends
#[derive(Clone)]
pub struct GlobalTransactionManager {
    /// Atomic counter for generating unique transaction IDs
    next_tx_id: Arc<AtomicU64>,

    /// Active (uncommitted) transactions
    active_transactions: Arc<RwLock<HashSet<TransactionId>>>,

    locks: Arc<dyn LockManager>,
}

impl std::fmt::Debug for GlobalTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalTransactionManager")
            .field("next_tx_id", &self.next_tx_id)
            .field("active_transactions", &self.active_transactions)
            .finish_non_exhaustive()
    }
}

impl GlobalTransactionManager {
    #[must_use]
    pub fn new(locks: Arc<dyn LockManager>) -> Self {
        Self {
            // Start from 1 (0 is reserved for bootstrap data)
            next_tx_id: Arc::new(AtomicU64::new(1)),
            active_transactions: Arc::new(RwLock::new(HashSet::new())),
            locks,
        }
    }

    #[must_use]
    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// Begins a new transaction and takes its snapshot
    pub fn begin(&self, database: DatabaseId, isolation: IsolationLevel) -> Transaction {
        let mut active = self.active_transactions.write();

        let xid = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let snapshot = Self::snapshot_of(&active, xid + 1);
        active.insert(xid);

        debug!(xid, database, isolation = isolation.as_str(), "begin");
        Transaction {
            xid,
            database,
            isolation,
            snapshot,
        }
    }

    /// Commits a transaction, making its work visible to new snapshots
    pub fn commit(&self, tx: &Transaction) {
        self.active_transactions.write().remove(&tx.xid);
        self.locks.release_all(tx.xid);
        debug!(xid = tx.xid, "commit");
    }

    /// Rolls back a transaction; its locks are released like at commit
    pub fn rollback(&self, tx: &Transaction) {
        self.active_transactions.write().remove(&tx.xid);
        self.locks.release_all(tx.xid);
        debug!(xid = tx.xid, "rollback");
    }

    #[must_use]
    pub fn is_active(&self, xid: TransactionId) -> bool {
        self.active_transactions.read().contains(&xid)
    }

    /// Next ID that will be assigned to a transaction
    #[must_use]
    pub fn current_tx_id(&self) -> TransactionId {
        self.next_tx_id.load(Ordering::SeqCst)
    }

    /// Fresh snapshot, as taken by each READ COMMITTED statement
    #[must_use]
    pub fn get_snapshot(&self) -> Snapshot {
        let active = self.active_transactions.read();
        Self::snapshot_of(&active, self.next_tx_id.load(Ordering::SeqCst))
    }

    fn snapshot_of(active: &HashSet<TransactionId>, xmax: TransactionId) -> Snapshot {
        let active_txs: Vec<_> = active.iter().copied().collect();
        // If no active transactions, xmin = xmax (all previous txs committed)
        let xmin = active_txs.iter().min().copied().unwrap_or(xmax);
        Snapshot::new(xmin, xmax, active_txs)
    }
}
