//! Predicate walker: folds a predicate tree into the set of partitions that
//! may hold matching rows.
//!
//! Every node produces an immutable [`WrapperNode`]; parents combine their
//! children by intersection (AND) or union (OR). Shapes the walker cannot
//! reason about select every partition and clear `exact`.

use std::cmp::Ordering;

use crate::core::{PathmanError, Result, Value};
use crate::partition::{
    OutOfRange, PartRelationInfo, RangeDirectory, SearchResult, ValueComparator,
};
use super::expr::{CompareOp, Expr};
use super::rangeset::RangeSet;

/// Estimated selectivity of an inequality against an unknown value
pub const DEFAULT_INEQ_SEL: f64 = 1.0 / 3.0;

/// Estimated selectivity of `BETWEEN` with an unknown bound
pub const DEFAULT_RANGE_INEQ_SEL: f64 = 0.005;

/// Result of walking one predicate subtree
#[derive(Debug, Clone)]
pub struct WrapperNode<'e> {
    pub orig: &'e Expr,
    pub args: Vec<WrapperNode<'e>>,
    /// Candidate directory positions
    pub rangeset: RangeSet,
    /// Some value of the subtree fell into a hole between two partitions
    pub found_gap: bool,
    /// `false` when the candidate set over-approximates
    pub exact: bool,
    /// Planner estimate in `(0, 1]`, only below 1 when parameters are involved
    pub paramsel: f64,
}

impl<'e> WrapperNode<'e> {
    fn leaf(orig: &'e Expr, rangeset: RangeSet, found_gap: bool, exact: bool) -> Self {
        Self {
            orig,
            args: Vec::new(),
            rangeset,
            found_gap,
            exact,
            paramsel: 1.0,
        }
    }

    fn unknown(orig: &'e Expr, ctx: &WalkerContext<'_>) -> Self {
        Self::leaf(orig, RangeSet::all(ctx.prel.children_count(), true), false, false)
    }

    fn param(orig: &'e Expr, ctx: &WalkerContext<'_>, paramsel: f64) -> Self {
        Self {
            paramsel: paramsel.clamp(f64::MIN_POSITIVE, 1.0),
            ..Self::unknown(orig, ctx)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalkerContext<'a> {
    pub prel: &'a PartRelationInfo,
    /// Execution-time parameter values, `$1` is `params[0]`
    pub params: Option<&'a [Value]>,
}

impl<'a> WalkerContext<'a> {
    #[must_use]
    pub const fn new(prel: &'a PartRelationInfo) -> Self {
        Self { prel, params: None }
    }

    #[must_use]
    pub const fn with_params(prel: &'a PartRelationInfo, params: &'a [Value]) -> Self {
        Self {
            prel,
            params: Some(params),
        }
    }

    fn is_part_column(&self, expr: &Expr) -> bool {
        matches!(expr, Expr::Column(name) if name.eq_ignore_ascii_case(&self.prel.column))
    }

    fn nparts(&self) -> f64 {
        self.prel.children_count().max(1) as f64
    }
}

enum Operand {
    Value(Value),
    Param,
}

fn operand(expr: &Expr, ctx: &WalkerContext<'_>) -> Result<Option<Operand>> {
    match expr {
        Expr::Const(v) => Ok(Some(Operand::Value(v.clone()))),
        Expr::Param { index, .. } => match ctx.params {
            None => Ok(Some(Operand::Param)),
            Some(params) => index
                .checked_sub(1)
                .and_then(|i| params.get(i))
                .map(|v| Some(Operand::Value(v.clone())))
                .ok_or_else(|| PathmanError::InvalidRequest(format!("no value supplied for parameter ${index}"))),
        },
        _ => Ok(None),
    }
}

/// Smallest value above `value` for types with discrete steps
fn successor(value: &Value) -> Option<Value> {
    match value {
        Value::SmallInt(i) => i.checked_add(1).map(Value::SmallInt),
        Value::Integer(i) => i.checked_add(1).map(Value::Integer),
        Value::Date(d) => d.succ_opt().map(Value::Date),
        _ => None,
    }
}

/// Selects directory positions satisfying `column op value`.
///
/// Returns the candidates and whether `value` itself fell into a gap.
/// Partitions that only partly satisfy the comparison are marked lossy.
pub fn select_range_partitions(
    value: &Value,
    op: CompareOp,
    ranges: &RangeDirectory,
    cmp: &dyn ValueComparator,
) -> Result<(RangeSet, bool)> {
    let n = ranges.len();
    let search = ranges.locate(value, cmp)?;
    let found_gap = matches!(search, SearchResult::Gap(_));

    let starts_at = |i: usize| -> Result<bool> {
        match ranges.get(i).and_then(|e| e.lower.as_ref()) {
            Some(lower) => Ok(cmp.compare(value, lower)? == Ordering::Equal),
            None => Ok(false),
        }
    };

    use CompareOp::*;
    use SearchResult::{Found, Gap};

    let set = match (op, search) {
        (Eq, Found(i)) => RangeSet::single(i, true),
        (Eq, _) => RangeSet::empty(),

        (Lt, Found(i)) if starts_at(i)? => RangeSet::span(0, i, false),
        (Lt | LtEq, Found(i)) => RangeSet::span(0, i, false).union(&RangeSet::single(i, true)),
        (Lt | LtEq, Gap(i)) => RangeSet::span(0, i, false),
        (Lt | LtEq, SearchResult::OutOfRange(OutOfRange::Below)) => RangeSet::empty(),
        (Lt | LtEq, SearchResult::OutOfRange(OutOfRange::Above)) => RangeSet::all(n, false),

        (GtEq, Found(i)) if starts_at(i)? => RangeSet::span(i, n, false),
        (Gt | GtEq, Found(i)) => RangeSet::single(i, true).union(&RangeSet::span(i + 1, n, false)),
        (Gt | GtEq, Gap(i)) => RangeSet::span(i, n, false),
        (Gt | GtEq, SearchResult::OutOfRange(OutOfRange::Below)) => RangeSet::all(n, false),
        (Gt | GtEq, SearchResult::OutOfRange(OutOfRange::Above)) => RangeSet::empty(),

        (NotEq, _) => RangeSet::all(n, true),
    };

    Ok((set, found_gap))
}

/// `column op key` for a non-NULL key already in canonical form
fn compare_leaf<'e>(
    orig: &'e Expr,
    op: CompareOp,
    key: Value,
    ctx: &WalkerContext<'_>,
) -> Result<WrapperNode<'e>> {
    let prel = ctx.prel;

    if let Some(hash) = prel.hash() {
        return Ok(match op {
            CompareOp::Eq => WrapperNode::leaf(orig, RangeSet::single(hash.bucket_for(&key), true), false, true),
            _ => WrapperNode::unknown(orig, ctx),
        });
    }
    let Some(ranges) = prel.range() else {
        return Ok(WrapperNode::unknown(orig, ctx));
    };

    // On discrete types `> v` is `>= v+1` and `<= v` is `< v+1`, which keeps
    // partitions starting at v+1 out of (or fully inside) the result
    let (op, key) = match op {
        CompareOp::Gt | CompareOp::LtEq => match successor(&key) {
            Some(next) if op == CompareOp::Gt => (CompareOp::GtEq, next),
            Some(next) => (CompareOp::Lt, next),
            None => (op, key),
        },
        _ => (op, key),
    };

    let (rangeset, found_gap) = select_range_partitions(&key, op, ranges, prel.comparator())?;
    // An equality landing in a hole may belong to a partition that does not exist yet
    let exact = !(op == CompareOp::Eq && found_gap);
    Ok(WrapperNode::leaf(orig, rangeset, found_gap, exact))
}

fn walk_compare<'e>(
    orig: &'e Expr,
    op: CompareOp,
    left: &Expr,
    right: &Expr,
    ctx: &WalkerContext<'_>,
) -> Result<WrapperNode<'e>> {
    let (op, other) = if ctx.is_part_column(left) {
        (op, right)
    } else if ctx.is_part_column(right) {
        (op.commute(), left)
    } else {
        return Ok(WrapperNode::unknown(orig, ctx));
    };

    if op == CompareOp::NotEq {
        return Ok(WrapperNode::unknown(orig, ctx));
    }

    match operand(other, ctx)? {
        None => Ok(WrapperNode::unknown(orig, ctx)),
        Some(Operand::Param) => {
            let sel = if op == CompareOp::Eq { 1.0 / ctx.nparts() } else { DEFAULT_INEQ_SEL };
            Ok(WrapperNode::param(orig, ctx, sel))
        }
        // Comparisons with NULL are never true
        Some(Operand::Value(Value::Null)) => Ok(WrapperNode::leaf(orig, RangeSet::empty(), false, true)),
        Some(Operand::Value(v)) => {
            let key = ctx.prel.key_of(&v)?;
            compare_leaf(orig, op, key, ctx)
        }
    }
}

fn walk_between<'e>(
    orig: &'e Expr,
    expr: &Expr,
    low: &Expr,
    high: &Expr,
    ctx: &WalkerContext<'_>,
) -> Result<WrapperNode<'e>> {
    if !ctx.is_part_column(expr) {
        return Ok(WrapperNode::unknown(orig, ctx));
    }

    let (low, high) = match (operand(low, ctx)?, operand(high, ctx)?) {
        (Some(Operand::Value(lo)), Some(Operand::Value(hi))) => (lo, hi),
        (Some(_), Some(_)) => return Ok(WrapperNode::param(orig, ctx, DEFAULT_RANGE_INEQ_SEL)),
        _ => return Ok(WrapperNode::unknown(orig, ctx)),
    };
    if low.is_null() || high.is_null() {
        return Ok(WrapperNode::leaf(orig, RangeSet::empty(), false, true));
    }

    let low = ctx.prel.key_of(&low)?;
    let high = ctx.prel.key_of(&high)?;
    match ctx.prel.comparator().compare(&low, &high)? {
        Ordering::Greater => Ok(WrapperNode::leaf(orig, RangeSet::empty(), false, true)),
        Ordering::Equal => compare_leaf(orig, CompareOp::Eq, low, ctx),
        Ordering::Less if ctx.prel.hash().is_some() => Ok(WrapperNode::unknown(orig, ctx)),
        Ordering::Less => {
            let from = compare_leaf(orig, CompareOp::GtEq, low, ctx)?;
            let to = compare_leaf(orig, CompareOp::LtEq, high, ctx)?;
            Ok(WrapperNode::leaf(
                orig,
                from.rangeset.intersect(&to.rangeset),
                from.found_gap || to.found_gap,
                from.exact && to.exact,
            ))
        }
    }
}

fn walk_in_list<'e>(
    orig: &'e Expr,
    expr: &Expr,
    list: &[Expr],
    ctx: &WalkerContext<'_>,
) -> Result<WrapperNode<'e>> {
    if !ctx.is_part_column(expr) {
        return Ok(WrapperNode::unknown(orig, ctx));
    }

    let mut values = Vec::with_capacity(list.len());
    for item in list {
        match operand(item, ctx)? {
            None => return Ok(WrapperNode::unknown(orig, ctx)),
            Some(Operand::Param) => {
                let sel = (list.len() as f64 / ctx.nparts()).min(1.0);
                return Ok(WrapperNode::param(orig, ctx, sel));
            }
            Some(Operand::Value(v)) => values.push(v),
        }
    }

    let mut node = WrapperNode::leaf(orig, RangeSet::empty(), false, true);
    for v in values.iter().filter(|v| !v.is_null()) {
        let point = compare_leaf(orig, CompareOp::Eq, ctx.prel.key_of(v)?, ctx)?;
        node.rangeset = node.rangeset.union(&point.rangeset);
        node.found_gap |= point.found_gap;
        node.exact &= point.exact;
    }
    Ok(node)
}

/// Walks `expr` and returns the wrapper of its root
pub fn walk_expr_tree<'e>(expr: &'e Expr, ctx: &WalkerContext<'_>) -> Result<WrapperNode<'e>> {
    let n = ctx.prel.children_count();

    match expr {
        Expr::And(args) => {
            let args = args.iter().map(|a| walk_expr_tree(a, ctx)).collect::<Result<Vec<_>>>()?;
            let mut rangeset = RangeSet::all(n, false);
            let (mut found_gap, mut exact, mut paramsel) = (false, true, 1.0);
            for arg in &args {
                rangeset = rangeset.intersect(&arg.rangeset);
                found_gap |= arg.found_gap;
                exact &= arg.exact;
                paramsel *= arg.paramsel;
            }
            Ok(WrapperNode { orig: expr, args, rangeset, found_gap, exact, paramsel })
        }
        Expr::Or(args) => {
            let args = args.iter().map(|a| walk_expr_tree(a, ctx)).collect::<Result<Vec<_>>>()?;
            let mut rangeset = RangeSet::empty();
            let (mut found_gap, mut exact, mut miss) = (false, true, 1.0);
            for arg in &args {
                rangeset = rangeset.union(&arg.rangeset);
                found_gap |= arg.found_gap;
                exact &= arg.exact;
                miss *= 1.0 - arg.paramsel;
            }
            let paramsel = if args.is_empty() { 1.0 } else { 1.0 - miss };
            Ok(WrapperNode { orig: expr, args, rangeset, found_gap, exact, paramsel })
        }
        Expr::Const(Value::Boolean(true)) => Ok(WrapperNode::leaf(expr, RangeSet::all(n, false), false, true)),
        Expr::Const(Value::Boolean(false) | Value::Null) => {
            Ok(WrapperNode::leaf(expr, RangeSet::empty(), false, true))
        }
        Expr::Compare { op, left, right } => walk_compare(expr, *op, left, right, ctx),
        Expr::Between { expr: e, low, high } => walk_between(expr, e, low, high, ctx),
        Expr::InList { expr: e, list } => walk_in_list(expr, e, list, ctx),
        // Partition keys are never NULL
        Expr::IsNull(e) if ctx.is_part_column(e) => Ok(WrapperNode::leaf(expr, RangeSet::empty(), false, true)),
        Expr::IsNotNull(e) if ctx.is_part_column(e) => {
            Ok(WrapperNode::leaf(expr, RangeSet::all(n, false), false, true))
        }
        _ => Ok(WrapperNode::unknown(expr, ctx)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::relation_info::test_util::{hash_info, range_info};
    use crate::pruning::rangeset::IndexRange;

    fn int(i: i64) -> Value {
        Value::Integer(i)
    }

    fn walk(expr: &Expr, prel: &PartRelationInfo) -> (Vec<usize>, bool) {
        let node = walk_expr_tree(expr, &WalkerContext::new(prel)).unwrap();
        (node.rangeset.indexes().collect(), node.exact)
    }

    #[test]
    fn test_equality_selects_one_partition() {
        let prel = range_info(&[(1, 11), (11, 21), (21, 31)]);
        assert_eq!(walk(&Expr::col_op("id", CompareOp::Eq, int(15)), &prel), (vec![1], true));
        // Upper bounds are exclusive
        assert_eq!(walk(&Expr::col_op("id", CompareOp::Eq, int(11)), &prel), (vec![1], true));
        assert_eq!(walk(&Expr::col_op("id", CompareOp::Eq, int(99)), &prel), (vec![], true));
    }

    #[test]
    fn test_range_operators_select_slices() {
        let prel = range_info(&[(1, 11), (11, 21), (21, 31)]);
        assert_eq!(walk(&Expr::col_op("id", CompareOp::Lt, int(11)), &prel), (vec![0], true));
        assert_eq!(walk(&Expr::col_op("id", CompareOp::LtEq, int(11)), &prel), (vec![0, 1], true));
        assert_eq!(walk(&Expr::col_op("id", CompareOp::Gt, int(20)), &prel), (vec![2], true));
        assert_eq!(walk(&Expr::col_op("id", CompareOp::GtEq, int(15)), &prel), (vec![1, 2], true));
        assert_eq!(walk(&Expr::col_op("id", CompareOp::Gt, int(-100)), &prel), (vec![0, 1, 2], true));
        assert_eq!(walk(&Expr::col_op("id", CompareOp::Lt, int(-100)), &prel), (vec![], true));
    }

    #[test]
    fn test_commuted_constant() {
        let prel = range_info(&[(1, 11), (11, 21), (21, 31)]);
        let e = Expr::compare(CompareOp::Lt, Expr::Const(int(15)), Expr::column("id"));
        assert_eq!(walk(&e, &prel), (vec![1, 2], true));
    }

    #[test]
    fn test_lossy_marks_partial_partitions() {
        let prel = range_info(&[(1, 11), (11, 21), (21, 31)]);
        let ge15 = Expr::col_op("id", CompareOp::GtEq, int(15));
        let node = walk_expr_tree(&ge15, &WalkerContext::new(&prel)).unwrap();
        assert_eq!(
            node.rangeset.ranges(),
            &[IndexRange::new(1, 1, true), IndexRange::new(2, 2, false)]
        );

        let ge11 = Expr::col_op("id", CompareOp::GtEq, int(11));
        let node = walk_expr_tree(&ge11, &WalkerContext::new(&prel)).unwrap();
        assert!(!node.rangeset.any_lossy());
    }

    #[test]
    fn test_and_or() {
        let prel = range_info(&[(1, 11), (11, 21), (21, 31), (31, 41)]);
        let and = Expr::and(vec![
            Expr::col_op("id", CompareOp::GtEq, int(15)),
            Expr::col_op("id", CompareOp::Lt, int(31)),
        ]);
        assert_eq!(walk(&and, &prel), (vec![1, 2], true));

        let or = Expr::or(vec![
            Expr::col_op("id", CompareOp::Eq, int(5)),
            Expr::col_op("id", CompareOp::Eq, int(35)),
        ]);
        assert_eq!(walk(&or, &prel), (vec![0, 3], true));

        assert_eq!(walk(&Expr::and(vec![]), &prel), (vec![0, 1, 2, 3], true));
        assert_eq!(walk(&Expr::or(vec![]), &prel), (vec![], true));
    }

    #[test]
    fn test_between_and_in() {
        let prel = range_info(&[(1, 11), (11, 21), (21, 31), (31, 41)]);
        assert_eq!(walk(&Expr::between("id", int(12), int(25)), &prel), (vec![1, 2], true));
        assert_eq!(walk(&Expr::between("id", int(25), int(12)), &prel), (vec![], true));
        assert_eq!(
            walk(&Expr::in_list("id", vec![int(2), int(33), Value::Null]), &prel),
            (vec![0, 3], true)
        );
    }

    #[test]
    fn test_unknown_constructs() {
        let prel = range_info(&[(1, 11), (11, 21)]);
        let all = vec![0, 1];

        assert_eq!(walk(&Expr::col_op("id", CompareOp::NotEq, int(5)), &prel), (all.clone(), false));
        assert_eq!(walk(&Expr::negate(Expr::col_op("id", CompareOp::Eq, int(5))), &prel), (all.clone(), false));
        assert_eq!(walk(&Expr::col_op("other", CompareOp::Eq, int(5)), &prel), (all.clone(), false));

        let not_isolated = Expr::compare(
            CompareOp::Eq,
            Expr::Function {
                name: "+".to_string(),
                args: vec![Expr::column("id"), Expr::Const(int(1))],
                volatile: false,
            },
            Expr::Const(int(5)),
        );
        assert_eq!(walk(&not_isolated, &prel), (all.clone(), false));

        // An OR with an unknown branch cannot narrow anything
        let or = Expr::or(vec![
            Expr::col_op("id", CompareOp::Eq, int(5)),
            Expr::col_op("name", CompareOp::Eq, Value::Text("x".to_string())),
        ]);
        assert_eq!(walk(&or, &prel), (all, false));

        // An AND still narrows through its known branch
        let and = Expr::and(vec![
            Expr::col_op("id", CompareOp::Eq, int(5)),
            Expr::col_op("name", CompareOp::Eq, Value::Text("x".to_string())),
        ]);
        assert_eq!(walk(&and, &prel), (vec![0], false));
    }

    #[test]
    fn test_gaps() {
        let prel = range_info(&[(1, 11), (21, 31)]);

        let in_gap = Expr::col_op("id", CompareOp::Eq, int(15));
        let node = walk_expr_tree(&in_gap, &WalkerContext::new(&prel)).unwrap();
        assert!(node.rangeset.is_empty());
        assert!(node.found_gap);
        assert!(!node.exact);

        // Range operators stay exact across a gap
        let across_gap = Expr::col_op("id", CompareOp::Gt, int(15));
        let node = walk_expr_tree(&across_gap, &WalkerContext::new(&prel)).unwrap();
        assert_eq!(node.rangeset.indexes().collect::<Vec<_>>(), vec![1]);
        assert!(node.found_gap);
        assert!(node.exact);
    }

    #[test]
    fn test_nulls() {
        let prel = range_info(&[(1, 11), (11, 21)]);
        assert_eq!(walk(&Expr::IsNull(Box::new(Expr::column("id"))), &prel), (vec![], true));
        assert_eq!(walk(&Expr::IsNotNull(Box::new(Expr::column("id"))), &prel), (vec![0, 1], true));
        assert_eq!(walk(&Expr::col_op("id", CompareOp::Eq, Value::Null), &prel), (vec![], true));
    }

    #[test]
    fn test_type_mismatch() {
        let prel = range_info(&[(1, 11)]);
        let e = Expr::col_op("id", CompareOp::Eq, Value::Text("a".to_string()));
        assert!(matches!(
            walk_expr_tree(&e, &WalkerContext::new(&prel)),
            Err(PathmanError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_params_estimate_selectivity() {
        let prel = range_info(&[(1, 11), (11, 21), (21, 31), (31, 41)]);
        let eq = Expr::compare(CompareOp::Eq, Expr::column("id"), Expr::param(1, None));
        let node = walk_expr_tree(&eq, &WalkerContext::new(&prel)).unwrap();
        assert_eq!(node.rangeset.len(), 4);
        assert!(!node.exact);
        assert!((node.paramsel - 0.25).abs() < 1e-9);

        let gt = Expr::compare(CompareOp::Gt, Expr::column("id"), Expr::param(2, None));
        let and = Expr::and(vec![eq.clone(), gt.clone()]);
        let node = walk_expr_tree(&and, &WalkerContext::new(&prel)).unwrap();
        assert!((node.paramsel - 0.25 * DEFAULT_INEQ_SEL).abs() < 1e-9);

        let or = Expr::or(vec![eq.clone(), gt]);
        let node = walk_expr_tree(&or, &WalkerContext::new(&prel)).unwrap();
        let expected = 1.0 - (1.0 - 0.25) * (1.0 - DEFAULT_INEQ_SEL);
        assert!((node.paramsel - expected).abs() < 1e-9);

        // Bound at execution time they prune like constants
        let params = [int(25)];
        let node = walk_expr_tree(&eq, &WalkerContext::with_params(&prel, &params)).unwrap();
        assert_eq!(node.rangeset.indexes().collect::<Vec<_>>(), vec![2]);
        assert!(node.exact);

        assert!(walk_expr_tree(&eq, &WalkerContext::with_params(&prel, &[])).is_err());
    }

    #[test]
    fn test_hash_pruning() {
        let prel = hash_info(4);
        let bucket = prel.hash().unwrap().bucket_for(&int(7));
        assert_eq!(walk(&Expr::col_op("id", CompareOp::Eq, int(7)), &prel), (vec![bucket], true));
        assert_eq!(
            walk(&Expr::col_op("id", CompareOp::Lt, int(7)), &prel),
            (vec![0, 1, 2, 3], false)
        );
        let in_list = Expr::in_list("id", vec![int(7), int(7)]);
        assert_eq!(walk(&in_list, &prel), (vec![bucket], true));
    }

    #[test]
    fn test_boolean_constants() {
        let prel = range_info(&[(1, 11), (11, 21), (21, 31)]);
        let yes = Expr::constant(Value::Boolean(true));
        let no = Expr::constant(Value::Boolean(false));
        assert_eq!(walk(&yes, &prel), (vec![0, 1, 2], true));
        assert_eq!(walk(&no, &prel), (vec![], true));

        let e = Expr::or(vec![no, Expr::col_op("id", CompareOp::Eq, int(12))]);
        assert_eq!(walk(&e, &prel), (vec![1], true));
        let e = Expr::and(vec![yes, Expr::col_op("id", CompareOp::Lt, int(11))]);
        assert_eq!(walk(&e, &prel), (vec![0], true));
    }
}
