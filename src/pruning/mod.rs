//! Partition pruning: predicate trees, the walker and a WHERE-clause parser

pub mod expr;
pub mod parser;
pub mod rangeset;
pub mod walker;

pub use expr::{CompareOp, Expr};
pub use parser::{parse_data_type, parse_predicate, parse_value};
pub use rangeset::{IndexRange, RangeSet};
pub use walker::{select_range_partitions, walk_expr_tree, WalkerContext, WrapperNode};

use tracing::trace;

use crate::core::{RelationId, Result, Value};
use crate::partition::PartRelationInfo;

/// One partition a query has to scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunedPartition {
    pub partition: RelationId,
    /// The predicate must still be evaluated on this partition's rows
    pub recheck: bool,
}

#[derive(Debug, Clone)]
pub struct PruneResult {
    pub rangeset: RangeSet,
    pub partitions: Vec<PrunedPartition>,
    /// `false` when `partitions` may contain more than necessary
    pub exact: bool,
    pub found_gap: bool,
    pub selectivity: f64,
}

impl PruneResult {
    fn from_node(node: &WrapperNode<'_>, prel: &PartRelationInfo) -> Self {
        let partitions = node
            .rangeset
            .ranges()
            .iter()
            .flat_map(|r| (r.lower..=r.upper).map(move |i| (i, r.lossy)))
            .filter_map(|(i, lossy)| {
                prel.child(i).map(|partition| PrunedPartition {
                    partition,
                    recheck: lossy,
                })
            })
            .collect();

        Self {
            rangeset: node.rangeset.clone(),
            partitions,
            exact: node.exact,
            found_gap: node.found_gap,
            selectivity: node.paramsel,
        }
    }

    #[must_use]
    pub fn relation_ids(&self) -> Vec<RelationId> {
        self.partitions.iter().map(|p| p.partition).collect()
    }
}

/// Planning-time pruning; parameters select every partition
pub fn prune(expr: &Expr, prel: &PartRelationInfo) -> Result<PruneResult> {
    let node = walk_expr_tree(expr, &WalkerContext::new(prel))?;
    trace!(relid = prel.parent, %expr, candidates = %node.rangeset, exact = node.exact, "pruned");
    Ok(PruneResult::from_node(&node, prel))
}

/// Execution-time pruning with `$n` bound to `params[n - 1]`
pub fn prune_with_params(expr: &Expr, prel: &PartRelationInfo, params: &[Value]) -> Result<PruneResult> {
    let node = walk_expr_tree(expr, &WalkerContext::with_params(prel, params))?;
    trace!(relid = prel.parent, %expr, candidates = %node.rangeset, exact = node.exact, "pruned with params");
    Ok(PruneResult::from_node(&node, prel))
}
