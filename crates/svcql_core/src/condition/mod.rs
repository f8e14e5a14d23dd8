//! Predicate trees for WHERE and HAVING clauses.
pub mod eval;
pub mod resolve;

use std::fmt;

use svcql_error::{DbError, Result};
use svcql_parser::ast::{BinaryOperator, Expr, FunctionArg, Literal, UnaryOperator};

use crate::types::ScalarValue;
use crate::types::convert::literal_to_scalar;

/// Delimiter used when encoding an IN-list into a single string value.
pub const IN_LIST_DELIMITER: char = ';';

/// Name of the pseudo function used to pass parameters through a WHERE
/// clause, e.g. `PARAMETER('region') = 'EU'`.
pub const PARAMETER_FUNCTION: &str = "PARAMETER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionOperator {
    And,
    Or,
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionFunction {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    IsNull,
    IsNotNull,
    /// Value is an encoded list, see [`IN_LIST_DELIMITER`].
    InList,
    Like,
    /// Reserved pseudo predicate carrying a caller parameter. Always true.
    Parameter,
}

impl ConditionFunction {
    fn from_operator(op: &BinaryOperator) -> Option<Self> {
        Some(match op {
            BinaryOperator::Eq => Self::Eq,
            BinaryOperator::NotEq => Self::NotEq,
            BinaryOperator::Lt => Self::Lt,
            BinaryOperator::LtEq => Self::LtEq,
            BinaryOperator::Gt => Self::Gt,
            BinaryOperator::GtEq => Self::GtEq,
            _ => return None,
        })
    }

    /// Whether the right hand side is a single literal that can be
    /// converted to the field type.
    pub const fn takes_value(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::NotEq | Self::Lt | Self::LtEq | Self::Gt | Self::GtEq | Self::Like
        )
    }
}

impl fmt::Display for ConditionFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
            Self::InList => "IN",
            Self::Like => "LIKE",
            Self::Parameter => "PARAMETER",
        };
        write!(f, "{s}")
    }
}

/// Leaf predicate: `<left_field> <function> <right_field | value>`.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicCondition {
    pub left_field: Option<String>,
    pub function: ConditionFunction,
    pub right_field: Option<String>,
    pub value: Option<ScalarValue>,
    pub negated: bool,
}

impl AtomicCondition {
    pub fn new(
        left_field: impl Into<String>,
        function: ConditionFunction,
        value: Option<ScalarValue>,
    ) -> Self {
        AtomicCondition {
            left_field: Some(left_field.into()),
            function,
            right_field: None,
            value,
            negated: false,
        }
    }

    /// Split an encoded IN-list value into its elements.
    pub fn list_elements(&self) -> Vec<String> {
        match &self.value {
            Some(ScalarValue::String(s)) if !s.is_empty() => {
                s.split(IN_LIST_DELIMITER).map(|e| e.to_string()).collect()
            }
            Some(ScalarValue::Null) | None => Vec::new(),
            Some(other) => vec![other.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeCondition {
    pub operator: ConditionOperator,
    pub negated: bool,
    pub children: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Composite(CompositeCondition),
    Atomic(AtomicCondition),
}

impl Condition {
    /// Build a condition tree from a parsed boolean expression.
    pub fn from_expr(expr: &Expr) -> Result<Self> {
        match expr {
            Expr::Nested(inner) => Self::from_expr(inner),
            Expr::UnaryExpr {
                op: UnaryOperator::Not,
                expr,
            } => Ok(Self::from_expr(expr)?.negate()),
            Expr::BinaryExpr {
                left,
                op: op @ (BinaryOperator::And | BinaryOperator::Or),
                right,
            } => {
                let operator = match op {
                    BinaryOperator::And => ConditionOperator::And,
                    _ => ConditionOperator::Or,
                };
                let mut children = Vec::new();
                for side in [left, right] {
                    match Self::from_expr(side)? {
                        // Flatten nested conjunctions/disjunctions of the same kind.
                        Condition::Composite(c) if c.operator == operator && !c.negated => {
                            children.extend(c.children)
                        }
                        other => children.push(other),
                    }
                }
                Ok(Condition::Composite(CompositeCondition {
                    operator,
                    negated: false,
                    children,
                }))
            }
            Expr::BinaryExpr { left, op, right } => {
                let function = ConditionFunction::from_operator(op).ok_or_else(|| {
                    DbError::new(format!("Unsupported operator in condition: {op}"))
                })?;
                Self::from_comparison(left, function, right, op)
            }
            Expr::IsNull { expr, negated } => {
                let function = if *negated {
                    ConditionFunction::IsNotNull
                } else {
                    ConditionFunction::IsNull
                };
                Ok(Condition::Atomic(AtomicCondition::new(
                    condition_field(expr)?,
                    function,
                    None,
                )))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let mut elements = Vec::with_capacity(list.len());
                for item in list {
                    elements.push(expect_literal(item)?.to_string());
                }
                let mut atomic = AtomicCondition::new(
                    condition_field(expr)?,
                    ConditionFunction::InList,
                    Some(ScalarValue::String(
                        elements.join(&IN_LIST_DELIMITER.to_string()),
                    )),
                );
                atomic.negated = *negated;
                Ok(Condition::Atomic(atomic))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let mut atomic = AtomicCondition::new(
                    condition_field(expr)?,
                    ConditionFunction::Like,
                    Some(expect_literal(pattern)?),
                );
                atomic.negated = *negated;
                Ok(Condition::Atomic(atomic))
            }
            other => Err(DbError::new(format!("Unsupported condition: {other}"))),
        }
    }

    fn from_comparison(
        left: &Expr,
        function: ConditionFunction,
        right: &Expr,
        op: &BinaryOperator,
    ) -> Result<Self> {
        if let Some(name) = parameter_name(left)? {
            if function != ConditionFunction::Eq {
                return Err(DbError::new(format!(
                    "{PARAMETER_FUNCTION} only supports '=', got '{op}'"
                )));
            }
            let value = expect_literal(right)?;
            return Ok(Condition::Atomic(AtomicCondition::new(
                name,
                ConditionFunction::Parameter,
                Some(value),
            )));
        }

        match (left, right) {
            (left, Expr::Literal(lit)) => Ok(Condition::Atomic(AtomicCondition::new(
                condition_field(left)?,
                function,
                Some(literal_to_scalar(lit)?),
            ))),
            (Expr::Literal(lit), right) => {
                // Literal on the left, flip so the field is on the left.
                let flipped = ConditionFunction::from_operator(&op.flip()).unwrap_or(function);
                Ok(Condition::Atomic(AtomicCondition::new(
                    condition_field(right)?,
                    flipped,
                    Some(literal_to_scalar(lit)?),
                )))
            }
            (left, right) => Ok(Condition::Atomic(AtomicCondition {
                left_field: Some(condition_field(left)?),
                function,
                right_field: Some(condition_field(right)?),
                value: None,
                negated: false,
            })),
        }
    }

    pub fn negate(self) -> Self {
        match self {
            Condition::Atomic(mut a) => {
                a.negated = !a.negated;
                Condition::Atomic(a)
            }
            Condition::Composite(mut c) => {
                c.negated = !c.negated;
                Condition::Composite(c)
            }
        }
    }

    /// Visit every atomic leaf mutably.
    pub fn for_each_atomic_mut(&mut self, f: &mut impl FnMut(&mut AtomicCondition)) {
        match self {
            Condition::Atomic(a) => f(a),
            Condition::Composite(c) => {
                for child in &mut c.children {
                    child.for_each_atomic_mut(f);
                }
            }
        }
    }

    pub fn for_each_atomic(&self, f: &mut impl FnMut(&AtomicCondition)) {
        match self {
            Condition::Atomic(a) => f(a),
            Condition::Composite(c) => {
                for child in &c.children {
                    child.for_each_atomic(f);
                }
            }
        }
    }

    /// Names of all fields referenced by this tree.
    pub fn used_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        self.for_each_atomic(&mut |a| {
            for name in [&a.left_field, &a.right_field].into_iter().flatten() {
                if !fields.contains(name) {
                    fields.push(name.clone());
                }
            }
        });
        fields
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Atomic(a) => {
                if a.negated {
                    write!(f, "NOT ")?;
                }
                match a.function {
                    ConditionFunction::Parameter => {
                        write!(f, "{PARAMETER_FUNCTION}(")?;
                        if let Some(left) = &a.left_field {
                            write!(f, "{left}")?;
                        }
                        write!(f, ")")?;
                        if let Some(value) = &a.value {
                            write!(f, " = {value}")?;
                        }
                        Ok(())
                    }
                    function => {
                        write!(f, "{}", a.left_field.as_deref().unwrap_or("?"))?;
                        write!(f, " {function}")?;
                        if let Some(right) = &a.right_field {
                            write!(f, " {right}")?;
                        } else if let Some(value) = &a.value {
                            match value {
                                ScalarValue::String(s) => write!(f, " '{s}'")?,
                                other => write!(f, " {other}")?,
                            }
                        }
                        Ok(())
                    }
                }
            }
            Condition::Composite(c) => {
                if c.negated {
                    write!(f, "NOT ")?;
                }
                write!(f, "(")?;
                for (idx, child) in c.children.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " {} ", c.operator)?;
                    }
                    write!(f, "{child}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Field name referenced by an expression in a condition.
///
/// Plain columns use their name, aggregates use their canonical text so they
/// match the aggregate's output column.
fn condition_field(expr: &Expr) -> Result<String> {
    if let Some(name) = expr.column_name() {
        return Ok(name.to_string());
    }
    match expr {
        Expr::Function(_) => Ok(expr.to_string()),
        other => Err(DbError::new(format!(
            "Expected a field reference in condition, got {other}"
        ))),
    }
}

fn expect_literal(expr: &Expr) -> Result<ScalarValue> {
    match expr {
        Expr::Literal(lit) => literal_to_scalar(lit),
        Expr::Nested(inner) => expect_literal(inner),
        Expr::UnaryExpr {
            op: UnaryOperator::Minus,
            expr,
        } => match expect_literal(expr)? {
            ScalarValue::Integer(v) => Ok(ScalarValue::Integer(-v)),
            ScalarValue::Number(v) => Ok(ScalarValue::Number(-v)),
            other => Err(DbError::new(format!("Cannot negate {other}"))),
        },
        other => Err(DbError::new(format!("Expected a literal value, got {other}"))),
    }
}

/// Returns the parameter name if the expression is `PARAMETER('<name>')`.
fn parameter_name(expr: &Expr) -> Result<Option<String>> {
    let func = match expr {
        Expr::Function(func) if func.name() == PARAMETER_FUNCTION => func,
        _ => return Ok(None),
    };
    match func.args.as_slice() {
        [FunctionArg::Expr(Expr::Literal(Literal::SingleQuotedString(name)))] => {
            Ok(Some(name.clone()))
        }
        [FunctionArg::Expr(Expr::Ident(ident))] => Ok(Some(ident.value.clone())),
        _ => Err(DbError::new(format!(
            "{PARAMETER_FUNCTION} expects a single parameter name"
        ))),
    }
}

#[cfg(test)]
pub(crate) fn parse_condition(sql: &str) -> Condition {
    let query = svcql_parser::parse(&format!("SELECT * FROM t WHERE {sql}")).unwrap();
    Condition::from_expr(query.body.where_expr.as_ref().unwrap()).unwrap()
}
