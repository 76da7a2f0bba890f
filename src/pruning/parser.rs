//! WHERE-clause parser producing [`Expr`] trees
//!
//! Grammar (lowest precedence first):
//! `or := and (OR and)*`, `and := not (AND not)*`, `not := NOT not | primary`,
//! `primary := predicate | '(' or ')'`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{alpha1, char, digit1, multispace0, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, peek, recognize, success, verify},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use rust_decimal::Decimal;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::{DataType, PathmanError, Result, Value};
use super::expr::{CompareOp, Expr};

/// Functions whose result may change between calls within one statement
const VOLATILE_FUNCTIONS: &[&str] = &["random", "clock_timestamp", "nextval", "gen_random_uuid", "timeofday"];

const KEYWORDS: &[&str] = &["AND", "OR", "NOT", "IS", "NULL", "IN", "BETWEEN", "TRUE", "FALSE"];

pub fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

/// Case-insensitive keyword that is not the prefix of a longer word
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(
        tag_no_case(word),
        not(peek(satisfy(|c: char| c.is_alphanumeric() || c == '_'))),
    )
}

pub fn identifier(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            alt((alpha1, tag("_"))),
            take_while(|c: char| c.is_alphanumeric() || c == '_'),
        )),
        |s: &str| s.to_string(),
    )(input)
}

fn non_keyword_identifier(input: &str) -> IResult<&str, String> {
    verify(identifier, |s: &String| {
        let upper = s.to_uppercase();
        !KEYWORDS.contains(&upper.as_str())
    })(input)
}

fn type_size(input: &str) -> IResult<&str, usize> {
    delimited(
        ws(char('(')),
        ws(map_res(digit1, |s: &str| s.parse::<usize>())),
        ws(char(')')),
    )(input)
}

pub fn data_type(input: &str) -> IResult<&str, DataType> {
    alt((
        map(
            tuple((
                alt((keyword("NUMERIC"), keyword("DECIMAL"))),
                opt(delimited(
                    ws(char('(')),
                    pair(
                        ws(map_res(digit1, |s: &str| s.parse::<u8>())),
                        opt(preceded(ws(char(',')), ws(map_res(digit1, |s: &str| s.parse::<u8>())))),
                    ),
                    ws(char(')')),
                )),
            )),
            |(_, params)| match params {
                Some((p, s)) => DataType::Numeric { precision: p, scale: s.unwrap_or(0) },
                None => DataType::Numeric { precision: 10, scale: 0 },
            },
        ),
        map(keyword("SMALLINT"), |_| DataType::SmallInt),
        map(alt((keyword("INTEGER"), keyword("BIGINT"), keyword("INT"))), |_| DataType::Integer),
        map(alt((keyword("REAL"), keyword("FLOAT"), tag_no_case("DOUBLE PRECISION"))), |_| DataType::Real),
        map(preceded(keyword("VARCHAR"), opt(type_size)), |len| DataType::Varchar {
            max_length: len.unwrap_or(255),
        }),
        map(keyword("TEXT"), |_| DataType::Text),
        map(alt((keyword("BOOLEAN"), keyword("BOOL"))), |_| DataType::Boolean),
        map(keyword("TIMESTAMPTZ"), |_| DataType::TimestampTz),
        map(keyword("TIMESTAMP"), |_| DataType::Timestamp),
        map(keyword("DATE"), |_| DataType::Date),
        map(keyword("UUID"), |_| DataType::Uuid),
    ))(input)
}

fn quoted_literal(s: &str) -> Value {
    if let Ok(u) = Uuid::parse_str(s) {
        return Value::Uuid(u);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Value::Date(d);
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Value::TimestampTz(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Value::Timestamp(t);
    }
    Value::Text(s.to_string())
}

pub fn value(input: &str) -> IResult<&str, Value> {
    alt((
        map(keyword("NULL"), |_| Value::Null),
        map(keyword("TRUE"), |_| Value::Boolean(true)),
        map(keyword("FALSE"), |_| Value::Boolean(false)),
        map(delimited(char('\''), take_while(|c| c != '\''), char('\'')), quoted_literal),
        map_res(
            recognize(tuple((opt(char('-')), digit1, char('.'), digit1))),
            |s: &str| -> std::result::Result<Value, String> {
                match Decimal::from_str(s) {
                    Ok(d) => Ok(Value::Numeric(d)),
                    Err(_) => Ok(Value::Real(s.parse().map_err(|e| format!("{e:?}"))?)),
                }
            },
        ),
        // Integers that fit are SMALLINT literals, like in the host
        map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| -> std::result::Result<Value, String> {
            let num = s.parse::<i64>().map_err(|e| format!("{e:?}"))?;
            Ok(i16::try_from(num).map_or(Value::Integer(num), Value::SmallInt))
        }),
    ))(input)
}

fn param(input: &str) -> IResult<&str, Expr> {
    map(
        pair(
            preceded(char('$'), map_res(digit1, |s: &str| s.parse::<usize>())),
            opt(preceded(ws(tag("::")), data_type)),
        ),
        |(index, data_type)| Expr::Param { index, data_type },
    )(input)
}

fn function_call(input: &str) -> IResult<&str, Expr> {
    map(
        pair(
            identifier,
            delimited(ws(char('(')), separated_list0(ws(char(',')), operand), ws(char(')'))),
        ),
        |(name, args)| {
            let volatile = VOLATILE_FUNCTIONS.contains(&name.to_lowercase().as_str());
            Expr::Function { name, args, volatile }
        },
    )(input)
}

fn atom(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        param,
        map(value, Expr::Const),
        function_call,
        map(non_keyword_identifier, Expr::Column),
        delimited(char('('), operand, ws(char(')'))),
    )))(input)
}

/// Operand with at most one binary arithmetic operator (`id + 1`)
fn operand(input: &str) -> IResult<&str, Expr> {
    let (input, first) = atom(input)?;
    let (input, rest) = opt(pair(
        ws(alt((tag("+"), tag("-"), tag("*"), tag("/"), tag("%")))),
        atom,
    ))(input)?;

    Ok(match rest {
        Some((op, second)) => (
            input,
            Expr::Function {
                name: op.to_string(),
                args: vec![first, second],
                volatile: false,
            },
        ),
        None => (input, first),
    })
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    ws(alt((
        map(tag(">="), |_| CompareOp::GtEq),
        map(tag("<="), |_| CompareOp::LtEq),
        map(alt((tag("<>"), tag("!="))), |_| CompareOp::NotEq),
        map(tag("="), |_| CompareOp::Eq),
        map(tag(">"), |_| CompareOp::Gt),
        map(tag("<"), |_| CompareOp::Lt),
    )))(input)
}

fn predicate(input: &str) -> IResult<&str, Expr> {
    let (input, left) = operand(input)?;

    alt((
        map(
            tuple((ws(keyword("IS")), ws(keyword("NOT")), ws(keyword("NULL")))),
            |_| Expr::IsNotNull(Box::new(left.clone())),
        ),
        map(tuple((ws(keyword("IS")), ws(keyword("NULL")))), |_| {
            Expr::IsNull(Box::new(left.clone()))
        }),
        map(
            tuple((ws(keyword("BETWEEN")), operand, ws(keyword("AND")), operand)),
            |(_, low, _, high)| Expr::Between {
                expr: Box::new(left.clone()),
                low: Box::new(low),
                high: Box::new(high),
            },
        ),
        map(
            preceded(
                ws(keyword("IN")),
                delimited(ws(char('(')), separated_list1(ws(char(',')), operand), ws(char(')'))),
            ),
            |list| Expr::InList {
                expr: Box::new(left.clone()),
                list,
            },
        ),
        map(pair(compare_op, operand), |(op, right)| Expr::compare(op, left.clone(), right)),
        // A bare boolean operand (`TRUE`, `is_active`)
        map(success(()), |()| left.clone()),
    ))(input)
}

fn primary(input: &str) -> IResult<&str, Expr> {
    alt((predicate, delimited(ws(char('(')), or_expr, ws(char(')')))))(input)
}

fn not_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(keyword("NOT")), not_expr), Expr::negate),
        primary,
    ))(input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    map(separated_list1(ws(keyword("AND")), not_expr), |mut args| {
        if args.len() == 1 { args.remove(0) } else { Expr::And(args) }
    })(input)
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    map(separated_list1(ws(keyword("OR")), and_expr), |mut args| {
        if args.len() == 1 { args.remove(0) } else { Expr::Or(args) }
    })(input)
}

/// Parses a WHERE clause (without the `WHERE` keyword)
pub fn parse_predicate(input: &str) -> Result<Expr> {
    all_consuming(ws(or_expr))(input)
        .map(|(_, expr)| expr)
        .map_err(|e| PathmanError::ParseError(format!("invalid predicate '{input}': {e}")))
}

/// Parses a single literal, used by the shell for bounds and row values
pub fn parse_value(input: &str) -> Result<Value> {
    all_consuming(ws(value))(input)
        .map(|(_, v)| v)
        .map_err(|e| PathmanError::ParseError(format!("invalid value '{input}': {e}")))
}

/// Parses a type name such as `integer` or `numeric(10,2)`
pub fn parse_data_type(input: &str) -> Result<DataType> {
    all_consuming(ws(data_type))(input)
        .map(|(_, t)| t)
        .map_err(|e| PathmanError::ParseError(format!("unknown type '{input}': {e}")))
}
