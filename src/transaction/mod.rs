// Transaction module - transactions, table locks and the partitioning lock guard

mod guard;
mod lock;
mod manager;

pub use guard::{RelationLock, XactGuard, PARTITIONED_REL_LOCK, REL_DATA_LOCK};
pub use lock::{HostLockManager, LockAcquireResult, LockManager, LockMode, LockTag};
pub use manager::{GlobalTransactionManager, IsolationLevel, Snapshot, Transaction};
