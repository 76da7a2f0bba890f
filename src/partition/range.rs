//! Ordered range directory
//!
//! Each entry covers `[lower, upper)`. Entries are sorted by `lower` and never
//! overlap, but neighbours may leave a gap between them. Only the first entry
//! may have an open lower bound and only the last one an open upper bound.

use std::cmp::Ordering;

use crate::core::{PathmanError, RelationId, Result, TransactionId, Value};
use super::compare::ValueComparator;

#[derive(Debug, Clone, PartialEq)]
pub struct RangeEntry {
    pub partition: RelationId,
    /// `None` means minus infinity
    pub lower: Option<Value>,
    /// `None` means plus infinity
    pub upper: Option<Value>,
    /// Transaction that created the partition
    pub created_by: TransactionId,
}

impl RangeEntry {
    #[must_use]
    pub const fn new(partition: RelationId, lower: Value, upper: Value) -> Self {
        Self {
            partition,
            lower: Some(lower),
            upper: Some(upper),
            created_by: 0,
        }
    }

    #[must_use]
    pub const fn created_by(mut self, xid: TransactionId) -> Self {
        self.created_by = xid;
        self
    }

    /// Does `value` fall inside `[lower, upper)`?
    pub fn contains(&self, value: &Value, cmp: &dyn ValueComparator) -> Result<bool> {
        let above_lower = match &self.lower {
            Some(lower) => cmp.compare(value, lower)? != Ordering::Less,
            None => true,
        };
        let below_upper = match &self.upper {
            Some(upper) => cmp.compare(value, upper)? == Ordering::Less,
            None => true,
        };
        Ok(above_lower && below_upper)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfRange {
    Below,
    Above,
}

/// Outcome of a directory search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The value lies inside the entry at this index
    Found(usize),
    /// No entry covers the value; a new entry would be inserted at this index
    Gap(usize),
    /// The value lies outside the directory's span
    OutOfRange(OutOfRange),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeDirectory {
    entries: Vec<RangeEntry>,
}

impl RangeDirectory {
    #[must_use]
    pub const fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Builds a directory from entries in any order.
    ///
    /// Fails with `ConfigurationInconsistent` (reported against `parent`) when the
    /// entries overlap, are empty, or use open bounds anywhere but at the extremes.
    pub fn build(
        parent: RelationId,
        mut entries: Vec<RangeEntry>,
        cmp: &dyn ValueComparator,
    ) -> Result<Self> {
        let mut sort_error = None;
        entries.sort_by(|a, b| match (&a.lower, &b.lower) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => cmp.compare(x, y).unwrap_or_else(|e| {
                sort_error.get_or_insert(e);
                Ordering::Equal
            }),
        });
        if let Some(e) = sort_error {
            return Err(e);
        }

        let directory = Self { entries };
        directory.validate(parent, cmp)?;
        Ok(directory)
    }

    fn validate(&self, parent: RelationId, cmp: &dyn ValueComparator) -> Result<()> {
        let last = self.entries.len().saturating_sub(1);

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.lower.is_none() && i != 0 {
                return Err(PathmanError::inconsistent(
                    parent,
                    format!("partition {} has an open lower bound", entry.partition),
                ));
            }
            if entry.upper.is_none() && i != last {
                return Err(PathmanError::inconsistent(
                    parent,
                    format!("partition {} has an open upper bound", entry.partition),
                ));
            }
            if let (Some(lower), Some(upper)) = (&entry.lower, &entry.upper) {
                if cmp.compare(lower, upper)? != Ordering::Less {
                    return Err(PathmanError::inconsistent(
                        parent,
                        format!("partition {} has an empty range [{lower}, {upper})", entry.partition),
                    ));
                }
            }
        }

        for pair in self.entries.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if let (Some(prev_upper), Some(next_lower)) = (&prev.upper, &next.lower) {
                if cmp.compare(prev_upper, next_lower)? == Ordering::Greater {
                    return Err(PathmanError::inconsistent(
                        parent,
                        format!("partitions {} and {} overlap", prev.partition, next.partition),
                    ));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[RangeEntry] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&RangeEntry> {
        self.entries.get(index)
    }

    #[must_use]
    pub fn first(&self) -> Option<&RangeEntry> {
        self.entries.first()
    }

    #[must_use]
    pub fn last(&self) -> Option<&RangeEntry> {
        self.entries.last()
    }

    #[must_use]
    pub fn position(&self, partition: RelationId) -> Option<usize> {
        self.entries.iter().position(|e| e.partition == partition)
    }

    /// Binary search for `value`.
    ///
    /// Finds the first entry whose upper bound lies above `value`; the value is
    /// either inside that entry, in the gap before it, or past the last entry.
    pub fn locate(&self, value: &Value, cmp: &dyn ValueComparator) -> Result<SearchResult> {
        if self.entries.is_empty() {
            // Still check the value itself so a bad key is reported as such
            if value.is_null() {
                return Err(PathmanError::InvalidRequest("NULL partition key".to_string()));
            }
            return Ok(SearchResult::OutOfRange(OutOfRange::Above));
        }

        let mut lo = 0;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let past_upper = match &self.entries[mid].upper {
                Some(upper) => cmp.compare(value, upper)? != Ordering::Less,
                None => false,
            };
            if past_upper {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if lo == self.entries.len() {
            return Ok(SearchResult::OutOfRange(OutOfRange::Above));
        }

        let below_lower = match &self.entries[lo].lower {
            Some(lower) => cmp.compare(value, lower)? == Ordering::Less,
            None => false,
        };

        Ok(match (below_lower, lo) {
            (false, _) => SearchResult::Found(lo),
            (true, 0) => SearchResult::OutOfRange(OutOfRange::Below),
            (true, _) => SearchResult::Gap(lo),
        })
    }

    /// Returns a new directory with `entry` placed at its ordered position.
    ///
    /// The receiver is left untouched, readers holding it keep a consistent view.
    pub fn with_entry(&self, entry: RangeEntry, cmp: &dyn ValueComparator) -> Result<Self> {
        let overlap = |other: &RangeEntry| {
            PathmanError::CreationFailure(format!(
                "new partition {} overlaps partition {}",
                entry.partition, other.partition
            ))
        };

        let mut at = self.entries.len();
        for (i, existing) in self.entries.iter().enumerate() {
            let before = match (&entry.upper, &existing.lower) {
                (Some(upper), Some(lower)) => cmp.compare(upper, lower)? != Ordering::Greater,
                _ => false,
            };
            if before {
                at = i;
                break;
            }
        }

        if at > 0 {
            let prev = &self.entries[at - 1];
            let after_prev = match (&prev.upper, &entry.lower) {
                (Some(upper), Some(lower)) => cmp.compare(upper, lower)? != Ordering::Greater,
                _ => false,
            };
            if !after_prev {
                return Err(overlap(prev));
            }
        }
        if entry.lower.is_none() && at != 0 {
            return Err(overlap(&self.entries[0]));
        }
        if entry.upper.is_none() && at != self.entries.len() {
            return Err(overlap(&self.entries[at]));
        }
        if let (Some(lower), Some(upper)) = (&entry.lower, &entry.upper) {
            if cmp.compare(lower, upper)? != Ordering::Less {
                return Err(PathmanError::InvalidRequest(format!(
                    "empty range [{lower}, {upper})"
                )));
            }
        }

        let mut entries = self.entries.clone();
        entries.insert(at, entry);
        Ok(Self { entries })
    }

    /// Returns a new directory without `partition`, `None` if it is not listed
    #[must_use]
    pub fn without_partition(&self, partition: RelationId) -> Option<Self> {
        let at = self.position(partition)?;
        let mut entries = self.entries.clone();
        entries.remove(at);
        Some(Self { entries })
    }
}
