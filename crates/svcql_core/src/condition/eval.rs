use std::cmp::Ordering;

use svcql_error::{DbError, Result};

use super::{AtomicCondition, Condition, ConditionFunction, ConditionOperator};
use crate::types::convert::convert_literal;
use crate::types::{Row, RowSchema, ScalarValue};

impl Condition {
    /// Evaluate the condition against a row described by `schema`.
    pub fn evaluate(&self, schema: &RowSchema, row: &Row) -> Result<bool> {
        match self {
            Condition::Atomic(atomic) => {
                let result = evaluate_atomic(atomic, schema, row)?;
                Ok(result != atomic.negated)
            }
            Condition::Composite(composite) => {
                let result = match composite.operator {
                    ConditionOperator::And => {
                        let mut all = true;
                        for child in &composite.children {
                            if !child.evaluate(schema, row)? {
                                all = false;
                                break;
                            }
                        }
                        all
                    }
                    ConditionOperator::Or => {
                        let mut any = false;
                        for child in &composite.children {
                            if child.evaluate(schema, row)? {
                                any = true;
                                break;
                            }
                        }
                        any
                    }
                };
                Ok(result != composite.negated)
            }
        }
    }
}

fn field_value<'a>(schema: &RowSchema, row: &'a Row, name: &str) -> Result<&'a ScalarValue> {
    let idx = schema
        .index_of(name)
        .ok_or_else(|| DbError::new(format!("Unknown field in condition: {name}")))?;
    row.get(idx)
        .ok_or_else(|| DbError::new(format!("Row is missing a value for field: {name}")))
}

fn evaluate_atomic(atomic: &AtomicCondition, schema: &RowSchema, row: &Row) -> Result<bool> {
    if atomic.function == ConditionFunction::Parameter {
        return Ok(true);
    }

    let left = match &atomic.left_field {
        Some(name) => field_value(schema, row, name)?,
        // Cleared references never filter.
        None => return Ok(true),
    };

    match atomic.function {
        ConditionFunction::IsNull => return Ok(left.is_null()),
        ConditionFunction::IsNotNull => return Ok(!left.is_null()),
        ConditionFunction::InList => {
            if left.is_null() {
                return Ok(false);
            }
            let datatype = match left.datatype() {
                Some(datatype) => datatype,
                None => return Ok(false),
            };
            for element in atomic.list_elements() {
                let element = convert_literal(&ScalarValue::String(element), datatype)?;
                if left.compare(&element) == Some(Ordering::Equal) {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        _ => (),
    }

    let right = match (&atomic.right_field, &atomic.value) {
        (Some(name), _) => field_value(schema, row, name)?,
        (None, Some(value)) => value,
        (None, None) => {
            return Err(DbError::new(format!(
                "Condition on '{}' is missing a value",
                atomic.left_field.as_deref().unwrap_or_default()
            )));
        }
    };

    if atomic.function == ConditionFunction::Like {
        if left.is_null() || right.is_null() {
            return Ok(false);
        }
        return Ok(like_matches(&left.to_string(), &right.to_string()));
    }

    let ord = match left.compare(right) {
        Some(ord) => ord,
        None => return Ok(false),
    };

    Ok(match atomic.function {
        ConditionFunction::Eq => ord == Ordering::Equal,
        ConditionFunction::NotEq => ord != Ordering::Equal,
        ConditionFunction::Lt => ord == Ordering::Less,
        ConditionFunction::LtEq => ord != Ordering::Greater,
        ConditionFunction::Gt => ord == Ordering::Greater,
        ConditionFunction::GtEq => ord != Ordering::Less,
        other => return Err(DbError::new(format!("Unexpected condition function: {other}"))),
    })
}

/// SQL LIKE matching. `%` matches any run of characters, `_` matches exactly
/// one.
pub fn like_matches(input: &str, pattern: &str) -> bool {
    let input: Vec<char> = input.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let (mut i, mut p) = (0, 0);
    // Position of the last '%' seen and the input position it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while i < input.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == input[i]) {
            i += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, i));
            p += 1;
        } else if let Some((star_p, star_i)) = backtrack {
            p = star_p + 1;
            i = star_i + 1;
            backtrack = Some((star_p, star_i + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::parse_condition;
    use crate::types::{DataType, Field};

    fn schema() -> RowSchema {
        RowSchema::new([
            Field::new("name", DataType::String),
            Field::new("amount", DataType::Integer),
            Field::new("price", DataType::Number),
        ])
    }

    fn row(name: &str, amount: i64, price: f64) -> Row {
        vec![name.into(), amount.into(), price.into()]
    }

    #[test]
    fn like() {
        assert!(like_matches("hello", "h%o"));
        assert!(like_matches("hello", "_ello"));
        assert!(like_matches("hello", "%"));
        assert!(like_matches("", "%"));
        assert!(!like_matches("hello", "h_o"));
        assert!(like_matches("abcabc", "%bc"));
        assert!(!like_matches("abcab", "%bc"));
    }

    #[test]
    fn comparisons() {
        let cond = parse_condition("amount > 10 AND price <= 2.5");
        assert!(cond.evaluate(&schema(), &row("a", 11, 2.5)).unwrap());
        assert!(!cond.evaluate(&schema(), &row("a", 10, 2.5)).unwrap());
    }

    #[test]
    fn in_list_and_like() {
        let cond = parse_condition("amount IN (1, 2, 3) OR name LIKE 'x%'");
        assert!(cond.evaluate(&schema(), &row("a", 2, 0.0)).unwrap());
        assert!(cond.evaluate(&schema(), &row("xyz", 9, 0.0)).unwrap());
        assert!(!cond.evaluate(&schema(), &row("a", 9, 0.0)).unwrap());
    }

    #[test]
    fn null_handling() {
        let cond = parse_condition("name IS NULL");
        let r = vec![ScalarValue::Null, 1.into(), 1.0.into()];
        assert!(cond.evaluate(&schema(), &r).unwrap());
        let cond = parse_condition("name = 'a'");
        assert!(!cond.evaluate(&schema(), &r).unwrap());
    }

    #[test]
    fn parameter_always_true() {
        let cond = parse_condition("PARAMETER('x') = 'y' AND amount = 1");
        assert!(cond.evaluate(&schema(), &row("a", 1, 0.0)).unwrap());
    }

    #[test]
    fn unknown_field_errors() {
        let cond = parse_condition("missing = 1");
        cond.evaluate(&schema(), &row("a", 1, 0.0)).unwrap_err();
    }
}
