//! Sets of directory positions kept as sorted, disjoint index ranges

use std::fmt;

/// Inclusive run of directory positions `lower..=upper`.
///
/// `lossy` is set when some rows of those partitions may not satisfy the
/// predicate, so the executor must still filter them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRange {
    pub lower: usize,
    pub upper: usize,
    pub lossy: bool,
}

impl IndexRange {
    #[must_use]
    pub const fn new(lower: usize, upper: usize, lossy: bool) -> Self {
        Self { lower, upper, lossy }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.upper - self.lower + 1
    }

    #[must_use]
    pub const fn contains(&self, index: usize) -> bool {
        self.lower <= index && index <= self.upper
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<IndexRange>,
}

impl RangeSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Every position of a directory with `n` entries
    #[must_use]
    pub fn all(n: usize, lossy: bool) -> Self {
        Self::span(0, n, lossy)
    }

    #[must_use]
    pub fn single(index: usize, lossy: bool) -> Self {
        Self::span(index, index + 1, lossy)
    }

    /// Positions `from..to`; empty when `from >= to`
    #[must_use]
    pub fn span(from: usize, to: usize, lossy: bool) -> Self {
        if from >= to {
            return Self::empty();
        }
        Self {
            ranges: vec![IndexRange::new(from, to - 1, lossy)],
        }
    }

    #[must_use]
    pub fn ranges(&self) -> &[IndexRange] {
        &self.ranges
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of positions in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.iter().map(IndexRange::len).sum()
    }

    pub fn indexes(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().flat_map(|r| r.lower..=r.upper)
    }

    /// `Some(lossy)` if `index` is in the set
    #[must_use]
    pub fn lookup(&self, index: usize) -> Option<bool> {
        let at = self.ranges.partition_point(|r| r.upper < index);
        self.ranges
            .get(at)
            .filter(|r| r.contains(index))
            .map(|r| r.lossy)
    }

    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.lookup(index).is_some()
    }

    /// Does any position of the set need re-checking?
    #[must_use]
    pub fn any_lossy(&self) -> bool {
        self.ranges.iter().any(|r| r.lossy)
    }

    /// Appends a run that starts past the current end, merging with it when possible
    fn push(&mut self, range: IndexRange) {
        if let Some(last) = self.ranges.last_mut() {
            if last.upper + 1 == range.lower && last.lossy == range.lossy {
                last.upper = range.upper;
                return;
            }
        }
        self.ranges.push(range);
    }

    /// Splits both sets at every boundary and combines the flags of each piece
    fn combine(&self, other: &Self, merge: impl Fn(Option<bool>, Option<bool>) -> Option<bool>) -> Self {
        let mut points: Vec<usize> = self
            .ranges
            .iter()
            .chain(other.ranges.iter())
            .flat_map(|r| [r.lower, r.upper + 1])
            .collect();
        points.sort_unstable();
        points.dedup();

        let mut out = Self::empty();
        for pair in points.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if let Some(lossy) = merge(self.lookup(from), other.lookup(from)) {
                out.push(IndexRange::new(from, to - 1, lossy));
            }
        }
        out
    }

    /// Positions in either set; a position is exact if either side has it exact
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        self.combine(other, |a, b| match (a, b) {
            (Some(x), Some(y)) => Some(x && y),
            (Some(x), None) | (None, Some(x)) => Some(x),
            (None, None) => None,
        })
    }

    /// Positions in both sets; a position is lossy if either side has it lossy
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        self.combine(other, |a, b| match (a, b) {
            (Some(x), Some(y)) => Some(x || y),
            _ => None,
        })
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let mark = if r.lossy { "~" } else { "" };
            if r.lower == r.upper {
                write!(f, "{}{mark}", r.lower)?;
            } else {
                write!(f, "{}-{}{mark}", r.lower, r.upper)?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_and_len() {
        assert!(RangeSet::span(3, 3, false).is_empty());
        assert_eq!(RangeSet::all(5, false).len(), 5);
        assert_eq!(RangeSet::single(2, true).indexes().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_union_merges_adjacent_runs() {
        let a = RangeSet::span(0, 3, false);
        let b = RangeSet::span(3, 5, false);
        let u = a.union(&b);
        assert_eq!(u.ranges(), &[IndexRange::new(0, 4, false)]);
    }

    #[test]
    fn test_union_prefers_exact() {
        let a = RangeSet::span(0, 4, true);
        let b = RangeSet::span(2, 6, false);
        let u = a.union(&b);
        assert_eq!(u.ranges(), &[IndexRange::new(0, 1, true), IndexRange::new(2, 5, false)]);
        assert_eq!(u.to_string(), "{0-1~, 2-5}");
    }

    #[test]
    fn test_intersect_keeps_lossy() {
        let a = RangeSet::span(0, 4, true);
        let b = RangeSet::span(2, 6, false);
        let i = a.intersect(&b);
        assert_eq!(i.ranges(), &[IndexRange::new(2, 3, true)]);
        assert!(a.intersect(&RangeSet::empty()).is_empty());
        assert!(RangeSet::span(0, 2, false).intersect(&RangeSet::span(5, 7, false)).is_empty());
    }

    #[test]
    fn test_lookup() {
        let s = RangeSet::single(1, true).union(&RangeSet::span(4, 7, false));
        assert_eq!(s.lookup(0), None);
        assert_eq!(s.lookup(1), Some(true));
        assert_eq!(s.lookup(3), None);
        assert_eq!(s.lookup(6), Some(false));
        assert_eq!(s.lookup(7), None);
        assert_eq!(s.indexes().collect::<Vec<_>>(), vec![1, 4, 5, 6]);
    }
}
