use serde::{Deserialize, Serialize};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use super::error::{PathmanError, Result};
use super::value::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataType {
    // Numeric types
    SmallInt,
    Integer,
    Real,
    Numeric { precision: u8, scale: u8 }, // NUMERIC(p, s)
    // String types
    Text,
    Varchar { max_length: usize },  // VARCHAR(n)
    // Boolean
    Boolean,
    // Date/Time types
    Date,
    Timestamp,
    TimestampTz,
    // Special types
    Uuid,
}

impl DataType {
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::SmallInt => "smallint".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Real => "real".to_string(),
            Self::Numeric { precision, scale } => format!("numeric({precision},{scale})"),
            Self::Text => "text".to_string(),
            Self::Varchar { max_length } => format!("varchar({max_length})"),
            Self::Boolean => "boolean".to_string(),
            Self::Date => "date".to_string(),
            Self::Timestamp => "timestamp".to_string(),
            Self::TimestampTz => "timestamptz".to_string(),
            Self::Uuid => "uuid".to_string(),
        }
    }

    /// Can a value of this type be stored in (and compared against) a column of `self`?
    ///
    /// NULL is accepted by every type.
    #[must_use]
    pub const fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::SmallInt | Self::Integer, Value::SmallInt(_) | Value::Integer(_)) => true,
            (Self::Real, Value::Real(_) | Value::Numeric(_) | Value::SmallInt(_) | Value::Integer(_)) => true,
            (
                Self::Numeric { .. },
                Value::Numeric(_) | Value::SmallInt(_) | Value::Integer(_),
            ) => true,
            (Self::Text | Self::Varchar { .. }, Value::Text(_)) => true,
            (Self::Boolean, Value::Boolean(_)) => true,
            (Self::Date, Value::Date(_)) => true,
            (Self::Timestamp, Value::Timestamp(_)) => true,
            (Self::TimestampTz, Value::TimestampTz(_) | Value::Timestamp(_)) => true,
            (Self::Uuid, Value::Uuid(_)) => true,
            _ => false,
        }
    }

    /// Converts `value` to the canonical variant of this type.
    ///
    /// Partition bounds are always stored in canonical form so that
    /// comparisons inside one directory never cross variants.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        if !self.accepts(value) {
            return Err(PathmanError::type_mismatch(self, value));
        }

        let coerced = match (self, value) {
            (_, Value::Null) => Value::Null,
            (Self::SmallInt, v) => {
                let i = v.as_int().unwrap_or_default();
                let small = i16::try_from(i).map_err(|_| PathmanError::type_mismatch(self, v))?;
                Value::SmallInt(small)
            }
            (Self::Integer, v) => Value::Integer(v.as_int().unwrap_or_default()),
            (Self::Real, Value::Real(r)) => Value::Real(*r),
            (Self::Real, Value::Numeric(d)) => Value::Real(d.to_f64().unwrap_or(f64::NAN)),
            (Self::Real, v) => Value::Real(v.as_int().unwrap_or_default() as f64),
            (Self::Numeric { .. }, Value::Numeric(d)) => Value::Numeric(*d),
            (Self::Numeric { .. }, v) => Value::Numeric(Decimal::from(v.as_int().unwrap_or_default())),
            // Timestamps without zone are taken as UTC
            (Self::TimestampTz, Value::Timestamp(t)) => Value::TimestampTz(t.and_utc()),
            (_, v) => v.clone(),
        };

        if let (Self::Real, Value::Real(r)) = (self, &coerced) {
            if r.is_nan() {
                return Err(PathmanError::InvalidRequest("NaN cannot be a partition key".to_string()));
            }
        }

        Ok(coerced)
    }

    /// Types that support interval arithmetic (required for range auto-partitioning)
    #[must_use]
    pub const fn supports_interval(&self) -> bool {
        matches!(
            self,
            Self::SmallInt
                | Self::Integer
                | Self::Real
                | Self::Numeric { .. }
                | Self::Date
                | Self::Timestamp
                | Self::TimestampTz
        )
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}
