//! Normalizes condition trees against the schema a service actually produces.
use svcql_error::{DbError, Result};
use tracing::{debug, warn};

use super::{AtomicCondition, Condition, ConditionFunction, IN_LIST_DELIMITER};
use crate::types::convert::convert_literal;
use crate::types::{DataType, Parameters, RowSchema, ScalarValue};

/// Counts of what happened to the atomic nodes of a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveReport {
    pub converted: usize,
    pub parameters: usize,
    /// Left as is on purpose, e.g. a float compared to an integer field.
    pub skipped: usize,
    /// Failed to resolve. The node is kept unconverted.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AtomicOutcome {
    Converted,
    Parameter,
    Skipped,
    Unchanged,
}

#[derive(Debug)]
pub struct ConditionResolver<'a> {
    schema: &'a RowSchema,
}

impl<'a> ConditionResolver<'a> {
    pub fn new(schema: &'a RowSchema) -> Self {
        ConditionResolver { schema }
    }

    /// Resolve every atomic node in the tree.
    ///
    /// Literal values are converted to the type of the field they're compared
    /// against and parameter predicates are moved into `parameters`. A node
    /// that fails to resolve is logged and left unconverted, resolution never
    /// fails as a whole.
    pub fn resolve(&self, condition: &mut Condition, parameters: &mut Parameters) -> ResolveReport {
        let mut report = ResolveReport::default();
        condition.for_each_atomic_mut(&mut |atomic| {
            match self.resolve_atomic(atomic, parameters) {
                Ok(AtomicOutcome::Converted) => report.converted += 1,
                Ok(AtomicOutcome::Parameter) => report.parameters += 1,
                Ok(AtomicOutcome::Skipped) => report.skipped += 1,
                Ok(AtomicOutcome::Unchanged) => (),
                Err(e) => {
                    warn!(
                        field = atomic.left_field.as_deref().unwrap_or_default(),
                        function = %atomic.function,
                        error = %e,
                        "unable to resolve condition, leaving it unconverted"
                    );
                    report.failed += 1;
                }
            }
        });
        report
    }

    fn resolve_atomic(
        &self,
        atomic: &mut AtomicCondition,
        parameters: &mut Parameters,
    ) -> Result<AtomicOutcome> {
        if atomic.function == ConditionFunction::Parameter {
            return extract_parameter(atomic, parameters);
        }

        // Field to field comparisons and null checks have nothing to convert.
        if atomic.right_field.is_some() {
            return Ok(AtomicOutcome::Unchanged);
        }
        let value = match &atomic.value {
            Some(value) if !value.is_null() => value,
            _ => return Ok(AtomicOutcome::Unchanged),
        };

        let field_name = match &atomic.left_field {
            Some(name) => name,
            None => return Ok(AtomicOutcome::Unchanged),
        };
        let field = self
            .schema
            .field(field_name)
            .ok_or_else(|| DbError::new(format!("Field '{field_name}' not found in row schema")))?;

        match atomic.function {
            ConditionFunction::InList => {
                let datatype = field.datatype;
                let elements = atomic.list_elements();
                let mut converted = Vec::with_capacity(elements.len());
                for element in elements {
                    let value = convert_literal(&ScalarValue::String(element), datatype)?;
                    converted.push(value.to_string());
                }
                // The list itself stays encoded as a string.
                atomic.value = Some(ScalarValue::String(
                    converted.join(&IN_LIST_DELIMITER.to_string()),
                ));
                Ok(AtomicOutcome::Converted)
            }
            ConditionFunction::Like => {
                atomic.value = Some(convert_literal(value, DataType::String)?);
                Ok(AtomicOutcome::Converted)
            }
            _ => {
                if matches!(value, ScalarValue::Number(_)) && field.datatype == DataType::Integer
                {
                    // Keep the floating point literal, rounding would change
                    // the meaning of the comparison.
                    debug!(field = %field.name, %value, "skipping conversion of number literal for integer field");
                    return Ok(AtomicOutcome::Skipped);
                }
                let converted = convert_literal(value, field.datatype)?;
                atomic.value = Some(converted);
                Ok(AtomicOutcome::Converted)
            }
        }
    }
}

/// Move parameter predicates into `parameters`, leaving every other node
/// alone. Doesn't need a schema.
pub fn extract_parameters(condition: &mut Condition, parameters: &mut Parameters) -> usize {
    let mut extracted = 0;
    condition.for_each_atomic_mut(&mut |atomic| {
        if atomic.function != ConditionFunction::Parameter {
            return;
        }
        if let Ok(AtomicOutcome::Parameter) = extract_parameter(atomic, parameters) {
            extracted += 1;
        }
    });
    extracted
}

fn extract_parameter(
    atomic: &mut AtomicCondition,
    parameters: &mut Parameters,
) -> Result<AtomicOutcome> {
    let name = match atomic.left_field.take() {
        Some(name) => name,
        // Already extracted.
        None => return Ok(AtomicOutcome::Unchanged),
    };
    let value = match &atomic.value {
        Some(ScalarValue::Null) | None => String::new(),
        Some(value) => value.to_string(),
    };
    debug!(%name, %value, "extracted parameter from condition");
    parameters.insert(name, value);
    // Clear both references so field validation downstream can't trip on it.
    atomic.right_field = None;
    Ok(AtomicOutcome::Parameter)
}
