//! Range interval of auto-partitioned relations
//!
//! Stored as text in the configuration record (`"10"`, `"2.5"`, `"1 month"`,
//! `"7 days 12 hours"`) and parsed against the partition column's type.

use chrono::{Duration, Months};
use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res, opt},
    multi::separated_list1,
    sequence::{pair, preceded, terminated},
    IResult,
};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::core::{DataType, PathmanError, Result, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum RangeInterval {
    Integer(i64),
    Real(f64),
    Numeric(Decimal),
    Time { months: u32, duration: Duration },
}

#[derive(Debug, Clone, Copy)]
enum TimeUnit {
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
}

fn time_unit(input: &str) -> IResult<&str, TimeUnit> {
    // Longer spellings first, `min` would otherwise swallow `minutes`
    alt((
        map(alt((tag_no_case("years"), tag_no_case("year"))), |_| TimeUnit::Year),
        map(alt((tag_no_case("months"), tag_no_case("month"), tag_no_case("mons"), tag_no_case("mon"))), |_| TimeUnit::Month),
        map(alt((tag_no_case("weeks"), tag_no_case("week"))), |_| TimeUnit::Week),
        map(alt((tag_no_case("days"), tag_no_case("day"))), |_| TimeUnit::Day),
        map(alt((tag_no_case("hours"), tag_no_case("hour"))), |_| TimeUnit::Hour),
        map(alt((tag_no_case("minutes"), tag_no_case("minute"), tag_no_case("mins"), tag_no_case("min"))), |_| TimeUnit::Minute),
        map(alt((tag_no_case("seconds"), tag_no_case("second"), tag_no_case("secs"), tag_no_case("sec"))), |_| TimeUnit::Second),
    ))(input)
}

fn time_part(input: &str) -> IResult<&str, (u32, TimeUnit)> {
    pair(
        terminated(map_res(digit1, |s: &str| s.parse::<u32>()), opt(multispace1)),
        time_unit,
    )(input)
}

fn time_interval(input: &str) -> IResult<&str, Vec<(u32, TimeUnit)>> {
    all_consuming(terminated(
        preceded(multispace0, separated_list1(multispace1, time_part)),
        multispace0,
    ))(input)
}

impl RangeInterval {
    /// Parses interval text for a column of type `data_type`
    pub fn parse(text: &str, data_type: &DataType) -> Result<Self> {
        let text = text.trim();
        let invalid = || PathmanError::InvalidInterval(format!("'{text}' for {data_type}"));

        let interval = match data_type {
            DataType::SmallInt | DataType::Integer => {
                Self::Integer(text.parse::<i64>().map_err(|_| invalid())?)
            }
            DataType::Real => {
                let r = text.parse::<f64>().map_err(|_| invalid())?;
                if !r.is_finite() {
                    return Err(invalid());
                }
                Self::Real(r)
            }
            DataType::Numeric { .. } => Self::Numeric(Decimal::from_str(text).map_err(|_| invalid())?),
            DataType::Date | DataType::Timestamp | DataType::TimestampTz => {
                let (_, parts) = time_interval(text).map_err(|_| invalid())?;
                let mut months: u32 = 0;
                let mut duration = Duration::zero();
                for (n, unit) in parts {
                    let n64 = i64::from(n);
                    let part = match unit {
                        TimeUnit::Year => {
                            months = n.checked_mul(12).and_then(|m| months.checked_add(m)).ok_or_else(invalid)?;
                            continue;
                        }
                        TimeUnit::Month => {
                            months = months.checked_add(n).ok_or_else(invalid)?;
                            continue;
                        }
                        TimeUnit::Week => Duration::try_weeks(n64),
                        TimeUnit::Day => Duration::try_days(n64),
                        TimeUnit::Hour => Duration::try_hours(n64),
                        TimeUnit::Minute => Duration::try_minutes(n64),
                        TimeUnit::Second => Duration::try_seconds(n64),
                    };
                    duration = part
                        .and_then(|part| duration.checked_add(&part))
                        .ok_or_else(invalid)?;
                }
                if matches!(data_type, DataType::Date) && duration.num_seconds() % 86_400 != 0 {
                    return Err(PathmanError::InvalidInterval(format!(
                        "'{text}' is not a whole number of days"
                    )));
                }
                Self::Time { months, duration }
            }
            other => {
                return Err(PathmanError::InvalidInterval(format!(
                    "type {other} does not support range intervals"
                )))
            }
        };

        if !interval.is_positive() {
            return Err(PathmanError::InvalidInterval(format!("'{text}' must be positive")));
        }
        Ok(interval)
    }

    #[must_use]
    pub fn is_positive(&self) -> bool {
        match self {
            Self::Integer(i) => *i > 0,
            Self::Real(r) => *r > 0.0,
            Self::Numeric(d) => d.is_sign_positive() && !d.is_zero(),
            Self::Time { months, duration } => *months > 0 || *duration > Duration::zero(),
        }
    }

    /// `value + interval`
    pub fn add_to(&self, value: &Value) -> Result<Value> {
        self.shift(value, true)
    }

    /// `value - interval`
    pub fn subtract_from(&self, value: &Value) -> Result<Value> {
        self.shift(value, false)
    }

    fn shift(&self, value: &Value, forward: bool) -> Result<Value> {
        let overflow = || PathmanError::CreationFailure(format!("partition bound overflows near {value}"));
        let mismatch = || PathmanError::InvalidInterval(format!("{self:?} cannot be applied to {}", value.type_name()));

        let shifted = match (self, value) {
            (Self::Integer(step), Value::SmallInt(v)) => {
                let next = if forward { i64::from(*v).checked_add(*step) } else { i64::from(*v).checked_sub(*step) };
                Value::SmallInt(next.and_then(|n| i16::try_from(n).ok()).ok_or_else(overflow)?)
            }
            (Self::Integer(step), Value::Integer(v)) => {
                let next = if forward { v.checked_add(*step) } else { v.checked_sub(*step) };
                Value::Integer(next.ok_or_else(overflow)?)
            }
            (Self::Real(step), Value::Real(v)) => {
                let next = if forward { v + step } else { v - step };
                if !next.is_finite() {
                    return Err(overflow());
                }
                Value::Real(next)
            }
            (Self::Numeric(step), Value::Numeric(v)) => {
                let next = if forward { v.checked_add(*step) } else { v.checked_sub(*step) };
                Value::Numeric(next.ok_or_else(overflow)?)
            }
            (Self::Time { months, duration }, Value::Date(d)) => {
                let days = Duration::days(duration.num_days());
                let next = if forward {
                    d.checked_add_months(Months::new(*months)).and_then(|d| d.checked_add_signed(days))
                } else {
                    d.checked_sub_months(Months::new(*months)).and_then(|d| d.checked_sub_signed(days))
                };
                Value::Date(next.ok_or_else(overflow)?)
            }
            (Self::Time { months, duration }, Value::Timestamp(t)) => {
                let next = if forward {
                    t.checked_add_months(Months::new(*months)).and_then(|t| t.checked_add_signed(*duration))
                } else {
                    t.checked_sub_months(Months::new(*months)).and_then(|t| t.checked_sub_signed(*duration))
                };
                Value::Timestamp(next.ok_or_else(overflow)?)
            }
            (Self::Time { months, duration }, Value::TimestampTz(t)) => {
                let next = if forward {
                    t.checked_add_months(Months::new(*months)).and_then(|t| t.checked_add_signed(*duration))
                } else {
                    t.checked_sub_months(Months::new(*months)).and_then(|t| t.checked_sub_signed(*duration))
                };
                Value::TimestampTz(next.ok_or_else(overflow)?)
            }
            _ => return Err(mismatch()),
        };

        Ok(shifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> Value {
        Value::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn test_parse_numeric_intervals() {
        assert_eq!(RangeInterval::parse("10", &DataType::Integer).unwrap(), RangeInterval::Integer(10));
        assert_eq!(RangeInterval::parse(" 2.5 ", &DataType::Real).unwrap(), RangeInterval::Real(2.5));
        assert!(RangeInterval::parse("0", &DataType::Integer).is_err());
        assert!(RangeInterval::parse("-3", &DataType::Integer).is_err());
        assert!(RangeInterval::parse("abc", &DataType::Integer).is_err());
    }

    #[test]
    fn test_parse_time_intervals() {
        let i = RangeInterval::parse("1 month", &DataType::Date).unwrap();
        assert_eq!(i, RangeInterval::Time { months: 1, duration: Duration::zero() });

        let i = RangeInterval::parse("2 days 12 hours", &DataType::Timestamp).unwrap();
        assert_eq!(i, RangeInterval::Time { months: 0, duration: Duration::hours(60) });

        let i = RangeInterval::parse("1 year 2 mons", &DataType::Date).unwrap();
        assert_eq!(i, RangeInterval::Time { months: 14, duration: Duration::zero() });

        assert!(RangeInterval::parse("3 hours", &DataType::Date).is_err());
        assert!(RangeInterval::parse("1 fortnight", &DataType::Date).is_err());
        assert!(RangeInterval::parse("1 day", &DataType::Text).is_err());
    }

    #[test]
    fn test_overflowing_intervals_are_rejected() {
        let weeks = "4294967295 weeks 4294967295 weeks 4294967295 weeks 4294967295 weeks";
        assert!(matches!(
            RangeInterval::parse(weeks, &DataType::Date),
            Err(PathmanError::InvalidInterval(_))
        ));
        assert!(matches!(
            RangeInterval::parse(&format!("{weeks} 1 second"), &DataType::Timestamp),
            Err(PathmanError::InvalidInterval(_))
        ));
        assert!(matches!(
            RangeInterval::parse("4294967295 years", &DataType::Date),
            Err(PathmanError::InvalidInterval(_))
        ));
        assert!(RangeInterval::parse("4294967295 weeks", &DataType::Date).is_ok());
    }

    #[test]
    fn test_shift_integers() {
        let i = RangeInterval::Integer(10);
        assert_eq!(i.add_to(&Value::Integer(11)).unwrap(), Value::Integer(21));
        assert_eq!(i.subtract_from(&Value::Integer(1)).unwrap(), Value::Integer(-9));
        assert!(i.add_to(&Value::Integer(i64::MAX)).is_err());
        assert!(i.add_to(&Value::SmallInt(i16::MAX)).is_err());
    }

    #[test]
    fn test_shift_dates_by_month() {
        let i = RangeInterval::parse("1 month", &DataType::Date).unwrap();
        assert_eq!(i.add_to(&date(2024, 1, 31)).unwrap(), date(2024, 2, 29));
        assert_eq!(i.subtract_from(&date(2024, 3, 1)).unwrap(), date(2024, 2, 1));
    }

    #[test]
    fn test_shift_rejects_foreign_type() {
        let i = RangeInterval::Integer(1);
        assert!(i.add_to(&Value::Text("x".to_string())).is_err());
    }
}
