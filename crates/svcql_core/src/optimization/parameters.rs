use svcql_error::Result;
use tracing::debug;

use super::PushDownOptimization;
use crate::condition::{Condition, ConditionFunction, ConditionOperator};
use crate::execution::{ExecutionPoint, QueryOrchestrator, TaskOutcome};
use crate::types::{Parameters, ScalarValue};

/// Maps a service field onto a source graph parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldParameter {
    pub field: String,
    pub parameter: String,
}

/// Pushes equality predicates on mapped fields into the source graph as
/// parameters so the source can skip rows the query would discard.
///
/// Only applies when the WHERE clause is a plain conjunction, the predicates
/// stay in the generated graph either way.
#[derive(Debug, Clone, Default)]
pub struct ParameterGeneration {
    mappings: Vec<FieldParameter>,
}

impl ParameterGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mapping(mut self, field: impl Into<String>, parameter: impl Into<String>) -> Self {
        self.mappings.push(FieldParameter {
            field: field.into(),
            parameter: parameter.into(),
        });
        self
    }

    /// Parameters derived from the condition.
    pub fn parameters_for(&self, condition: &Condition) -> Parameters {
        let equalities = conjunctive_equalities(condition);
        let mut parameters = Parameters::new();
        for mapping in &self.mappings {
            let found = equalities
                .iter()
                .find(|(field, _)| field.eq_ignore_ascii_case(&mapping.field));
            if let Some((_, value)) = found {
                parameters.insert(mapping.parameter.clone(), value.to_string());
            }
        }
        parameters
    }
}

/// `field = literal` predicates that must hold for every matching row.
fn conjunctive_equalities(condition: &Condition) -> Vec<(&str, &ScalarValue)> {
    match condition {
        Condition::Atomic(a) => {
            if a.negated || a.function != ConditionFunction::Eq || a.right_field.is_some() {
                return Vec::new();
            }
            match (&a.left_field, &a.value) {
                (Some(field), Some(value)) if !value.is_null() => vec![(field.as_str(), value)],
                _ => Vec::new(),
            }
        }
        Condition::Composite(c) => {
            if c.negated || c.operator != ConditionOperator::And {
                return Vec::new();
            }
            c.children.iter().flat_map(conjunctive_equalities).collect()
        }
    }
}

impl PushDownOptimization for ParameterGeneration {
    fn name(&self) -> &str {
        "parameter_generation"
    }

    fn activate(&self, orchestrator: &QueryOrchestrator) -> Result<bool> {
        let condition = match orchestrator.where_condition() {
            Some(condition) => condition,
            None => return Ok(false),
        };
        let parameters = self.parameters_for(condition);
        if parameters.is_empty() {
            return Ok(false);
        }

        debug!(id = %orchestrator.id(), ?parameters, "pushing predicates into source parameters");
        let source = orchestrator.source_graph().clone();
        orchestrator.listeners().add(ExecutionPoint::Optimize, move || {
            source.set_parameters(&parameters);
            Ok(TaskOutcome::Remove)
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::parse_condition;

    fn optimization() -> ParameterGeneration {
        ParameterGeneration::new()
            .with_mapping("region", "region")
            .with_mapping("year", "p_year")
    }

    #[test]
    fn conjunction_maps_fields() {
        let params = optimization().parameters_for(&parse_condition(
            "region = 'EU' AND year = 2024 AND amount > 3",
        ));
        assert_eq!(Some("EU"), params.get("region").map(|s| s.as_str()));
        assert_eq!(Some("2024"), params.get("p_year").map(|s| s.as_str()));
    }

    #[test]
    fn disjunction_or_negation_not_pushed() {
        assert!(
            optimization()
                .parameters_for(&parse_condition("region = 'EU' OR year = 2024"))
                .is_empty()
        );
        assert!(
            optimization()
                .parameters_for(&parse_condition("NOT region = 'EU'"))
                .is_empty()
        );
        assert!(
            optimization()
                .parameters_for(&parse_condition("region <> 'EU'"))
                .is_empty()
        );
    }
}
