//! Scalar expressions evaluated row by row.
use std::cmp::Ordering;

use svcql_error::{DbError, Result};
use svcql_parser::ast::{BinaryOperator, Expr, FunctionArg, UnaryOperator};

use super::aggregate::is_aggregate_function;
use crate::condition::eval::like_matches;
use crate::types::convert::{convert_literal, literal_to_scalar};
use crate::types::scalar::TIMESTAMP_FORMAT;
use crate::types::{DataType, Row, RowSchema, ScalarValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunction {
    Upper,
    Lower,
    /// `DATE_TO_STR(timestamp, format)`
    DateToStr,
    /// `IIF(condition, then, else)`
    Iif,
    Coalesce,
}

impl ScalarFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "UPPER" => Self::Upper,
            "LOWER" => Self::Lower,
            "DATE_TO_STR" => Self::DateToStr,
            "IIF" => Self::Iif,
            "COALESCE" => Self::Coalesce,
            _ => return None,
        })
    }

    fn check_arity(&self, count: usize) -> Result<()> {
        let ok = match self {
            Self::Upper | Self::Lower => count == 1,
            Self::DateToStr => count == 1 || count == 2,
            Self::Iif => count == 3,
            Self::Coalesce => count >= 1,
        };
        if ok {
            Ok(())
        } else {
            Err(DbError::new(format!(
                "Wrong number of arguments for {self:?}: {count}"
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    Column(usize),
    Literal(ScalarValue),
    Negate(Box<ScalarExpr>),
    Not(Box<ScalarExpr>),
    Binary {
        left: Box<ScalarExpr>,
        op: BinaryOperator,
        right: Box<ScalarExpr>,
    },
    Function {
        function: ScalarFunction,
        args: Vec<ScalarExpr>,
    },
    IsNull {
        expr: Box<ScalarExpr>,
        negated: bool,
    },
    InList {
        expr: Box<ScalarExpr>,
        list: Vec<ScalarExpr>,
        negated: bool,
    },
    Like {
        expr: Box<ScalarExpr>,
        pattern: Box<ScalarExpr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<ScalarExpr>>,
        conditions: Vec<ScalarExpr>,
        results: Vec<ScalarExpr>,
        else_result: Option<Box<ScalarExpr>>,
    },
}

impl ScalarExpr {
    /// Compile an AST expression against a schema.
    ///
    /// Columns and aggregate calls are looked up by name in the schema, so
    /// after aggregation `SUM(x)` refers to the aggregate's output column.
    pub fn compile(expr: &Expr, schema: &RowSchema) -> Result<Self> {
        if let Some(name) = expr.column_name() {
            let idx = schema
                .index_of(name)
                .ok_or_else(|| DbError::new(format!("Unknown column '{name}'")))?;
            return Ok(ScalarExpr::Column(idx));
        }

        Ok(match expr {
            Expr::Literal(lit) => ScalarExpr::Literal(literal_to_scalar(lit)?),
            Expr::Nested(inner) => Self::compile(inner, schema)?,
            Expr::UnaryExpr { op, expr } => {
                let inner = Box::new(Self::compile(expr, schema)?);
                match op {
                    UnaryOperator::Plus => *inner,
                    UnaryOperator::Minus => ScalarExpr::Negate(inner),
                    UnaryOperator::Not => ScalarExpr::Not(inner),
                }
            }
            Expr::BinaryExpr { left, op, right } => ScalarExpr::Binary {
                left: Box::new(Self::compile(left, schema)?),
                op: *op,
                right: Box::new(Self::compile(right, schema)?),
            },
            Expr::Function(func) => {
                let name = func.name();
                if is_aggregate_function(&name) {
                    let text = expr.to_string();
                    let idx = schema.index_of(&text).ok_or_else(|| {
                        DbError::new(format!("Aggregate function {text} is not allowed here"))
                    })?;
                    return Ok(ScalarExpr::Column(idx));
                }
                let function = ScalarFunction::from_name(&name)
                    .ok_or_else(|| DbError::new(format!("Unknown function: {name}")))?;
                let mut args = Vec::with_capacity(func.args.len());
                for arg in &func.args {
                    match arg {
                        FunctionArg::Expr(expr) => args.push(Self::compile(expr, schema)?),
                        FunctionArg::Wildcard => {
                            return Err(DbError::new(format!("{name} does not accept '*'")));
                        }
                    }
                }
                function.check_arity(args.len())?;
                ScalarExpr::Function { function, args }
            }
            Expr::IsNull { expr, negated } => ScalarExpr::IsNull {
                expr: Box::new(Self::compile(expr, schema)?),
                negated: *negated,
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => ScalarExpr::InList {
                expr: Box::new(Self::compile(expr, schema)?),
                list: list
                    .iter()
                    .map(|e| Self::compile(e, schema))
                    .collect::<Result<_>>()?,
                negated: *negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
            } => ScalarExpr::Like {
                expr: Box::new(Self::compile(expr, schema)?),
                pattern: Box::new(Self::compile(pattern, schema)?),
                negated: *negated,
            },
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => ScalarExpr::Case {
                operand: match operand {
                    Some(operand) => Some(Box::new(Self::compile(operand, schema)?)),
                    None => None,
                },
                conditions: conditions
                    .iter()
                    .map(|e| Self::compile(e, schema))
                    .collect::<Result<_>>()?,
                results: results
                    .iter()
                    .map(|e| Self::compile(e, schema))
                    .collect::<Result<_>>()?,
                else_result: match else_result {
                    Some(e) => Some(Box::new(Self::compile(e, schema)?)),
                    None => None,
                },
            },
            Expr::Ident(_) | Expr::CompoundIdent(_) => {
                // Handled by the column lookup above.
                return Err(DbError::new(format!("Unknown column '{expr}'")));
            }
        })
    }

    /// Type of the values this expression produces.
    pub fn datatype(&self, schema: &RowSchema) -> DataType {
        match self {
            ScalarExpr::Column(idx) => schema.fields[*idx].datatype,
            ScalarExpr::Literal(v) => v.datatype().unwrap_or(DataType::String),
            ScalarExpr::Negate(inner) => inner.datatype(schema),
            ScalarExpr::Not(_)
            | ScalarExpr::IsNull { .. }
            | ScalarExpr::InList { .. }
            | ScalarExpr::Like { .. } => DataType::Boolean,
            ScalarExpr::Binary { left, op, right } => match op {
                BinaryOperator::StringConcat => DataType::String,
                BinaryOperator::Divide => DataType::Number,
                BinaryOperator::Plus
                | BinaryOperator::Minus
                | BinaryOperator::Multiply
                | BinaryOperator::Modulo => {
                    match (left.datatype(schema), right.datatype(schema)) {
                        (DataType::Integer, DataType::Integer) => DataType::Integer,
                        _ => DataType::Number,
                    }
                }
                _ => DataType::Boolean,
            },
            ScalarExpr::Function { function, args } => match function {
                ScalarFunction::Upper | ScalarFunction::Lower | ScalarFunction::DateToStr => {
                    DataType::String
                }
                ScalarFunction::Iif => args[1].datatype(schema),
                ScalarFunction::Coalesce => args[0].datatype(schema),
            },
            ScalarExpr::Case { results, .. } => results
                .first()
                .map(|r| r.datatype(schema))
                .unwrap_or(DataType::String),
        }
    }

    pub fn eval(&self, row: &Row) -> Result<ScalarValue> {
        Ok(match self {
            ScalarExpr::Column(idx) => row
                .get(*idx)
                .cloned()
                .ok_or_else(|| DbError::new(format!("Row has no column {idx}")))?,
            ScalarExpr::Literal(v) => v.clone(),
            ScalarExpr::Negate(inner) => match inner.eval(row)? {
                ScalarValue::Integer(v) => ScalarValue::Integer(-v),
                ScalarValue::Number(v) => ScalarValue::Number(-v),
                ScalarValue::Null => ScalarValue::Null,
                other => return Err(DbError::new(format!("Cannot negate {other}"))),
            },
            ScalarExpr::Not(inner) => match inner.eval(row)? {
                ScalarValue::Null => ScalarValue::Null,
                v => ScalarValue::Boolean(!v.is_truthy()),
            },
            ScalarExpr::Binary { left, op, right } => {
                eval_binary(&left.eval(row)?, *op, &right.eval(row)?)?
            }
            ScalarExpr::Function { function, args } => eval_function(*function, args, row)?,
            ScalarExpr::IsNull { expr, negated } => {
                ScalarValue::Boolean(expr.eval(row)?.is_null() != *negated)
            }
            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => {
                let value = expr.eval(row)?;
                if value.is_null() {
                    return Ok(ScalarValue::Null);
                }
                let mut found = false;
                for item in list {
                    if value.compare(&item.eval(row)?) == Some(Ordering::Equal) {
                        found = true;
                        break;
                    }
                }
                ScalarValue::Boolean(found != *negated)
            }
            ScalarExpr::Like {
                expr,
                pattern,
                negated,
            } => {
                let value = expr.eval(row)?;
                let pattern = pattern.eval(row)?;
                if value.is_null() || pattern.is_null() {
                    return Ok(ScalarValue::Null);
                }
                ScalarValue::Boolean(
                    like_matches(&value.to_string(), &pattern.to_string()) != *negated,
                )
            }
            ScalarExpr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                let operand = match operand {
                    Some(operand) => Some(operand.eval(row)?),
                    None => None,
                };
                for (condition, result) in conditions.iter().zip(results) {
                    let condition = condition.eval(row)?;
                    let matched = match &operand {
                        Some(operand) => operand.compare(&condition) == Some(Ordering::Equal),
                        None => condition.is_truthy(),
                    };
                    if matched {
                        return result.eval(row);
                    }
                }
                match else_result {
                    Some(e) => e.eval(row)?,
                    None => ScalarValue::Null,
                }
            }
        })
    }
}

fn eval_binary(left: &ScalarValue, op: BinaryOperator, right: &ScalarValue) -> Result<ScalarValue> {
    match op {
        BinaryOperator::And => {
            return Ok(ScalarValue::Boolean(left.is_truthy() && right.is_truthy()));
        }
        BinaryOperator::Or => {
            return Ok(ScalarValue::Boolean(left.is_truthy() || right.is_truthy()));
        }
        _ => (),
    }

    if left.is_null() || right.is_null() {
        return Ok(ScalarValue::Null);
    }

    if op.is_comparison() {
        let ord = match left.compare(right) {
            Some(ord) => ord,
            None => return Ok(ScalarValue::Null),
        };
        let result = match op {
            BinaryOperator::Eq => ord == Ordering::Equal,
            BinaryOperator::NotEq => ord != Ordering::Equal,
            BinaryOperator::Lt => ord == Ordering::Less,
            BinaryOperator::LtEq => ord != Ordering::Greater,
            BinaryOperator::Gt => ord == Ordering::Greater,
            _ => ord != Ordering::Less,
        };
        return Ok(ScalarValue::Boolean(result));
    }

    if op == BinaryOperator::StringConcat {
        return Ok(ScalarValue::String(format!("{left}{right}")));
    }

    if let (ScalarValue::Integer(a), ScalarValue::Integer(b)) = (left, right) {
        let v = match op {
            BinaryOperator::Plus => a.checked_add(*b),
            BinaryOperator::Minus => a.checked_sub(*b),
            BinaryOperator::Multiply => a.checked_mul(*b),
            BinaryOperator::Modulo => a.checked_rem(*b),
            _ => None,
        };
        match (v, op) {
            (Some(v), _) => return Ok(ScalarValue::Integer(v)),
            (None, BinaryOperator::Divide) => (),
            (None, _) => {
                return Err(DbError::new(format!(
                    "Integer overflow or division by zero: {a} {op} {b}"
                )));
            }
        }
    }

    let (a, b) = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(DbError::new(format!(
                "Cannot apply '{op}' to {left} and {right}"
            )));
        }
    };
    let v = match op {
        BinaryOperator::Plus => a + b,
        BinaryOperator::Minus => a - b,
        BinaryOperator::Multiply => a * b,
        BinaryOperator::Divide => a / b,
        BinaryOperator::Modulo => a % b,
        other => return Err(DbError::new(format!("Unsupported operator: {other}"))),
    };
    Ok(ScalarValue::Number(v))
}

fn eval_function(function: ScalarFunction, args: &[ScalarExpr], row: &Row) -> Result<ScalarValue> {
    Ok(match function {
        ScalarFunction::Upper | ScalarFunction::Lower => match args[0].eval(row)? {
            ScalarValue::Null => ScalarValue::Null,
            v if function == ScalarFunction::Upper => ScalarValue::String(v.to_string().to_uppercase()),
            v => ScalarValue::String(v.to_string().to_lowercase()),
        },
        ScalarFunction::DateToStr => {
            let value = args[0].eval(row)?;
            let ts = match convert_literal(&value, DataType::Timestamp)? {
                ScalarValue::Timestamp(ts) => ts,
                _ => return Ok(ScalarValue::Null),
            };
            let format = match args.get(1) {
                Some(format) => strftime_pattern(&format.eval(row)?.to_string()),
                None => TIMESTAMP_FORMAT.to_string(),
            };
            ScalarValue::String(ts.format(&format).to_string())
        }
        ScalarFunction::Iif => {
            if args[0].eval(row)?.is_truthy() {
                args[1].eval(row)?
            } else {
                args[2].eval(row)?
            }
        }
        ScalarFunction::Coalesce => {
            for arg in args {
                let v = arg.eval(row)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            ScalarValue::Null
        }
    })
}

/// Translate a `yyyy-MM-dd HH:mm:ss.SSS` style pattern to strftime.
///
/// Patterns already containing `%` are used as is.
pub fn strftime_pattern(pattern: &str) -> String {
    if pattern.contains('%') {
        return pattern.to_string();
    }
    const REPLACEMENTS: &[(&str, &str)] = &[
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("SSS", "%3f"),
    ];
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;
    'outer: while !rest.is_empty() {
        for (from, to) in REPLACEMENTS {
            if let Some(stripped) = rest.strip_prefix(from) {
                out.push_str(to);
                rest = stripped;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}
