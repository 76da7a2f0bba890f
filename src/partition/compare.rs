//! Comparison functions for partition keys
//!
//! Directories never compare values on their own: every search receives a
//! comparator for the partition column's type, so a host with custom
//! collations or extra orderable types can plug its own ordering in.

use std::cmp::Ordering;
use std::fmt::Debug;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::core::{DataType, PathmanError, Result, Value};

pub trait ValueComparator: Send + Sync + Debug {
    /// Total order of two non-NULL values of the partition column's type
    fn compare(&self, a: &Value, b: &Value) -> Result<Ordering>;
}

/// Built-in ordering of a column type
#[derive(Debug, Clone)]
pub struct TypeComparator {
    data_type: DataType,
}

impl TypeComparator {
    #[must_use]
    pub const fn new(data_type: DataType) -> Self {
        Self { data_type }
    }

    #[must_use]
    pub const fn data_type(&self) -> &DataType {
        &self.data_type
    }

    fn check(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            return Err(PathmanError::InvalidRequest(
                "NULL is not comparable as a partition key".to_string(),
            ));
        }
        if !self.data_type.accepts(value) {
            return Err(PathmanError::type_mismatch(&self.data_type, value));
        }
        Ok(())
    }
}

impl ValueComparator for TypeComparator {
    fn compare(&self, a: &Value, b: &Value) -> Result<Ordering> {
        self.check(a)?;
        self.check(b)?;
        compare_values(a, b).ok_or_else(|| PathmanError::type_mismatch(&self.data_type, b))
    }
}

/// Orders two values of compatible types, `None` if they are not comparable
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::SmallInt(_) | Value::Integer(_), Value::SmallInt(_) | Value::Integer(_)) => {
            Some(a.as_int()?.cmp(&b.as_int()?))
        }
        (Value::Real(x), Value::Real(y)) => Some(x.total_cmp(y)),
        (Value::Real(x), Value::SmallInt(_) | Value::Integer(_)) => {
            Some(x.total_cmp(&(b.as_int()? as f64)))
        }
        (Value::SmallInt(_) | Value::Integer(_), Value::Real(y)) => {
            Some((a.as_int()? as f64).total_cmp(y))
        }
        (Value::Numeric(x), Value::Numeric(y)) => Some(x.cmp(y)),
        (Value::Numeric(x), Value::SmallInt(_) | Value::Integer(_)) => {
            Some(x.cmp(&Decimal::from(b.as_int()?)))
        }
        (Value::SmallInt(_) | Value::Integer(_), Value::Numeric(y)) => {
            Some(Decimal::from(a.as_int()?).cmp(y))
        }
        (Value::Real(x), Value::Numeric(y)) => Some(x.total_cmp(&y.to_f64()?)),
        (Value::Numeric(x), Value::Real(y)) => Some(x.to_f64()?.total_cmp(y)),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Boolean(x), Value::Boolean(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (Value::TimestampTz(x), Value::TimestampTz(y)) => Some(x.cmp(y)),
        (Value::TimestampTz(x), Value::Timestamp(y)) => Some(x.cmp(&y.and_utc())),
        (Value::Timestamp(x), Value::TimestampTz(y)) => Some(x.and_utc().cmp(y)),
        (Value::Uuid(x), Value::Uuid(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_integer_families_compare_numerically() {
        let cmp = TypeComparator::new(DataType::Integer);
        assert_eq!(cmp.compare(&Value::SmallInt(3), &Value::Integer(10)).unwrap(), Ordering::Less);
        assert_eq!(cmp.compare(&Value::Integer(10), &Value::Integer(10)).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_dates() {
        let cmp = TypeComparator::new(DataType::Date);
        let a = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let b = Value::Date(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(cmp.compare(&b, &a).unwrap(), Ordering::Greater);
    }

    #[test]
    fn test_type_mismatch() {
        let cmp = TypeComparator::new(DataType::Integer);
        let result = cmp.compare(&Value::Integer(1), &Value::Text("a".to_string()));
        assert!(matches!(result, Err(PathmanError::TypeMismatch { .. })));
    }

    #[test]
    fn test_null_is_rejected() {
        let cmp = TypeComparator::new(DataType::Integer);
        assert!(cmp.compare(&Value::Null, &Value::Integer(1)).is_err());
    }
}
