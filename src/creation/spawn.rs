//! Boundary planning for on-demand range partitions

use std::cmp::Ordering;

use crate::core::{PathmanError, Result, Value};
use crate::partition::{OutOfRange, RangeDirectory, RangeInterval, SearchResult, ValueComparator};

/// Bounds `[lower, upper)` of the partitions needed to cover `value`.
///
/// The list is in creation order, starting next to the existing partitions;
/// the last element covers `value`. Empty when `value` is already covered.
///
/// * above the last bound: a chain of `interval`-wide partitions from the last upper bound
/// * below the first bound: the same chain downwards from the first lower bound
/// * inside a gap: one partition aligned on the lower neighbour's upper bound,
///   clipped to the upper neighbour's lower bound
pub fn plan_spawn(
    directory: &RangeDirectory,
    interval: &RangeInterval,
    value: &Value,
    cmp: &dyn ValueComparator,
    max_partitions: usize,
) -> Result<Vec<(Value, Value)>> {
    let too_many = || {
        PathmanError::CreationFailure(format!(
            "covering {value} needs more than {max_partitions} new partitions"
        ))
    };

    match directory.locate(value, cmp)? {
        SearchResult::Found(_) => Ok(Vec::new()),

        SearchResult::OutOfRange(OutOfRange::Above) => {
            let start = directory
                .last()
                .ok_or_else(|| PathmanError::CreationFailure("relation has no partitions to extend".to_string()))?
                .upper
                .clone()
                .ok_or_else(|| PathmanError::CreationFailure("last partition has no upper bound".to_string()))?;

            let mut bounds = Vec::new();
            let mut lower = start;
            loop {
                if bounds.len() == max_partitions {
                    return Err(too_many());
                }
                let upper = interval.add_to(&lower)?;
                let covers = cmp.compare(value, &upper)? == Ordering::Less;
                bounds.push((lower, upper.clone()));
                if covers {
                    return Ok(bounds);
                }
                lower = upper;
            }
        }

        SearchResult::OutOfRange(OutOfRange::Below) => {
            let end = directory
                .first()
                .and_then(|e| e.lower.clone())
                .ok_or_else(|| PathmanError::CreationFailure("first partition has no lower bound".to_string()))?;

            let mut bounds = Vec::new();
            let mut upper = end;
            loop {
                if bounds.len() == max_partitions {
                    return Err(too_many());
                }
                let lower = interval.subtract_from(&upper)?;
                let covers = cmp.compare(value, &lower)? != Ordering::Less;
                bounds.push((lower.clone(), upper));
                if covers {
                    return Ok(bounds);
                }
                upper = lower;
            }
        }

        SearchResult::Gap(at) => {
            let prev = at.checked_sub(1).and_then(|i| directory.get(i));
            let (Some(prev), Some(next)) = (prev, directory.get(at)) else {
                return Err(PathmanError::CreationFailure(format!("no neighbours around gap {at}")));
            };
            let (Some(gap_start), Some(gap_end)) = (prev.upper.clone(), next.lower.clone()) else {
                return Err(PathmanError::CreationFailure("gap has an open bound".to_string()));
            };

            let mut lower = gap_start;
            let mut steps = 0;
            loop {
                let upper = interval.add_to(&lower)?;
                if cmp.compare(value, &upper)? == Ordering::Less {
                    let upper = if cmp.compare(&upper, &gap_end)? == Ordering::Greater { gap_end } else { upper };
                    return Ok(vec![(lower, upper)]);
                }
                steps += 1;
                if steps > max_partitions {
                    return Err(too_many());
                }
                lower = upper;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::partition::{RangeEntry, TypeComparator};
    use chrono::NaiveDate;

    fn int_dir(bounds: &[(i64, i64)]) -> (RangeDirectory, TypeComparator) {
        let cmp = TypeComparator::new(DataType::Integer);
        let entries = bounds
            .iter()
            .enumerate()
            .map(|(i, (lo, hi))| RangeEntry::new(100 + i as u32, Value::Integer(*lo), Value::Integer(*hi)))
            .collect();
        (RangeDirectory::build(1, entries, &cmp).unwrap(), cmp)
    }

    fn ints(bounds: &[(Value, Value)]) -> Vec<(i64, i64)> {
        bounds
            .iter()
            .map(|(lo, hi)| (lo.as_int().unwrap(), hi.as_int().unwrap()))
            .collect()
    }

    #[test]
    fn test_chain_above() {
        let (dir, cmp) = int_dir(&[(1, 11), (11, 21)]);
        let plan = plan_spawn(&dir, &RangeInterval::Integer(10), &Value::Integer(45), &cmp, 100).unwrap();
        assert_eq!(ints(&plan), vec![(21, 31), (31, 41), (41, 51)]);

        // Exactly on the next boundary needs one more partition
        let plan = plan_spawn(&dir, &RangeInterval::Integer(10), &Value::Integer(31), &cmp, 100).unwrap();
        assert_eq!(ints(&plan), vec![(21, 31), (31, 41)]);
    }

    #[test]
    fn test_chain_below() {
        let (dir, cmp) = int_dir(&[(1, 11)]);
        let plan = plan_spawn(&dir, &RangeInterval::Integer(10), &Value::Integer(-15), &cmp, 100).unwrap();
        assert_eq!(ints(&plan), vec![(-9, 1), (-19, -9)]);
    }

    #[test]
    fn test_gap_is_aligned_and_clipped() {
        let (dir, cmp) = int_dir(&[(1, 11), (36, 46)]);
        let plan = plan_spawn(&dir, &RangeInterval::Integer(10), &Value::Integer(15), &cmp, 100).unwrap();
        assert_eq!(ints(&plan), vec![(11, 21)]);

        let plan = plan_spawn(&dir, &RangeInterval::Integer(10), &Value::Integer(33), &cmp, 100).unwrap();
        assert_eq!(ints(&plan), vec![(31, 36)]);
    }

    #[test]
    fn test_covered_value_needs_nothing() {
        let (dir, cmp) = int_dir(&[(1, 11)]);
        assert!(plan_spawn(&dir, &RangeInterval::Integer(10), &Value::Integer(5), &cmp, 100).unwrap().is_empty());
    }

    #[test]
    fn test_limits() {
        let (dir, cmp) = int_dir(&[(1, 11)]);
        let result = plan_spawn(&dir, &RangeInterval::Integer(10), &Value::Integer(1_000), &cmp, 5);
        assert!(matches!(result, Err(PathmanError::CreationFailure(_))));

        let empty = RangeDirectory::empty();
        let result = plan_spawn(&empty, &RangeInterval::Integer(10), &Value::Integer(1), &cmp, 5);
        assert!(matches!(result, Err(PathmanError::CreationFailure(_))));
    }

    #[test]
    fn test_monthly_dates() {
        let cmp = TypeComparator::new(DataType::Date);
        let date = |m, d| Value::Date(NaiveDate::from_ymd_opt(2024, m, d).unwrap());
        let dir = RangeDirectory::build(1, vec![RangeEntry::new(100, date(1, 1), date(2, 1))], &cmp).unwrap();
        let interval = RangeInterval::parse("1 month", &DataType::Date).unwrap();

        let plan = plan_spawn(&dir, &interval, &date(3, 15), &cmp, 10).unwrap();
        assert_eq!(plan, vec![(date(2, 1), date(3, 1)), (date(3, 1), date(4, 1))]);
    }
}
