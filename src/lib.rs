// pgr_pathman - range/hash table partitioning for PostgreSQL-compatible query layers
// Partition directories, predicate pruning and on-demand partition creation

// Clippy configuration - allow non-critical warnings
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::module_name_repetitions)]

// Values, types, identifiers and errors
pub mod core;

// Range and hash directories, comparison, intervals
pub mod partition;

// Predicate trees, the pruning walker and the WHERE-clause parser
pub mod pruning;

// Transactions, table locks and the partitioning lock guard
pub mod transaction;

// Configuration records and the host catalog boundary
pub mod catalog;

// Process-wide partitioning cache
pub mod cache;

// On-demand partition creation and background workers
pub mod creation;

// Service facade for the host planner and executor
pub mod pathman;

// Runtime settings (config file + environment)
pub mod settings;

// Re-export commonly used types for convenience
pub use core::{Column, DataType, PathmanError, RelationId, Result, Row, Value};
pub use cache::{CacheLookup, CacheState, PathmanState};
pub use catalog::{ConfigStore, HostCatalog, InMemoryCatalog, MemoryConfigStore, FileConfigStore, PartType};
pub use creation::{CreationOrchestrator, CreationOutcome};
pub use pathman::{InsertTarget, Pathman, PartitionRow, ScanPlan};
pub use pruning::{parse_predicate, prune, prune_with_params, Expr, PruneResult};
pub use settings::PathmanSettings;
pub use transaction::{IsolationLevel, Transaction};
