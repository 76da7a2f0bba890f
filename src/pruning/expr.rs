use std::fmt;

use crate::core::{DataType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    /// Operator to use when the operands swap sides (`5 < id` is `id > 5`)
    #[must_use]
    pub const fn commute(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::LtEq => Self::GtEq,
            Self::Gt => Self::Lt,
            Self::GtEq => Self::LtEq,
            other => other,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        }
    }
}

/// Boolean predicate tree handed over by the host planner
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Const(Value),
    /// Value bound only at execution time (`$1`)
    Param { index: usize, data_type: Option<DataType> },
    Compare { op: CompareOp, left: Box<Expr>, right: Box<Expr> },
    Between { expr: Box<Expr>, low: Box<Expr>, high: Box<Expr> },
    InList { expr: Box<Expr>, list: Vec<Expr> },
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// Any function or operator the walker does not interpret (`id + 1`, `random()`)
    Function { name: String, args: Vec<Expr>, volatile: bool },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Self::Column(name.into())
    }

    #[must_use]
    pub const fn constant(value: Value) -> Self {
        Self::Const(value)
    }

    #[must_use]
    pub const fn param(index: usize, data_type: Option<DataType>) -> Self {
        Self::Param { index, data_type }
    }

    #[must_use]
    pub fn compare(op: CompareOp, left: Self, right: Self) -> Self {
        Self::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `column op value`, the most common shape
    pub fn col_op(column: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self::compare(op, Self::column(column), Self::Const(value))
    }

    pub fn between(column: impl Into<String>, low: Value, high: Value) -> Self {
        Self::Between {
            expr: Box::new(Self::column(column)),
            low: Box::new(Self::Const(low)),
            high: Box::new(Self::Const(high)),
        }
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::InList {
            expr: Box::new(Self::column(column)),
            list: values.into_iter().map(Self::Const).collect(),
        }
    }

    #[must_use]
    pub fn and(args: Vec<Self>) -> Self {
        Self::And(args)
    }

    #[must_use]
    pub fn or(args: Vec<Self>) -> Self {
        Self::Or(args)
    }

    #[must_use]
    pub fn negate(expr: Self) -> Self {
        Self::Not(Box::new(expr))
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(name) => write!(f, "{name}"),
            Self::Const(Value::Text(s)) => write!(f, "'{s}'"),
            Self::Const(v @ (Value::Date(_) | Value::Timestamp(_) | Value::TimestampTz(_) | Value::Uuid(_))) => {
                write!(f, "'{v}'")
            }
            Self::Const(v) => write!(f, "{v}"),
            Self::Param { index, data_type: Some(t) } => write!(f, "${index}::{t}"),
            Self::Param { index, data_type: None } => write!(f, "${index}"),
            Self::Compare { op, left, right } => write!(f, "{left} {} {right}", op.as_str()),
            Self::Between { expr, low, high } => write!(f, "{expr} BETWEEN {low} AND {high}"),
            Self::InList { expr, list } => {
                write!(f, "{expr} IN (")?;
                write_list(f, list, ", ")?;
                write!(f, ")")
            }
            Self::IsNull(e) => write!(f, "{e} IS NULL"),
            Self::IsNotNull(e) => write!(f, "{e} IS NOT NULL"),
            Self::And(args) => {
                write!(f, "(")?;
                write_list(f, args, " AND ")?;
                write!(f, ")")
            }
            Self::Or(args) => {
                write!(f, "(")?;
                write_list(f, args, " OR ")?;
                write!(f, ")")
            }
            Self::Not(e) => write!(f, "NOT {e}"),
            Self::Function { name, args, .. } if args.len() == 2 && !name.chars().any(char::is_alphanumeric) => {
                write!(f, "({} {name} {})", args[0], args[1])
            }
            Self::Function { name, args, .. } => {
                write!(f, "{name}(")?;
                write_list(f, args, ", ")?;
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commute() {
        assert_eq!(CompareOp::Lt.commute(), CompareOp::Gt);
        assert_eq!(CompareOp::GtEq.commute(), CompareOp::LtEq);
        assert_eq!(CompareOp::Eq.commute(), CompareOp::Eq);
    }

    #[test]
    fn test_display() {
        let e = Expr::and(vec![
            Expr::col_op("id", CompareOp::GtEq, Value::Integer(10)),
            Expr::in_list("id", vec![Value::Integer(1), Value::Integer(2)]),
            Expr::negate(Expr::col_op("name", CompareOp::Eq, Value::Text("x".to_string()))),
        ]);
        assert_eq!(e.to_string(), "(id >= 10 AND id IN (1, 2) AND NOT name = 'x')");
    }
}
