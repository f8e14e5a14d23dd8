use svcql_error::{DbError, Result};
use svcql_parser::ast::SelectItem;
use tracing::debug;

use super::aggregate::{AggregateOperator, AggregatePlan};
use super::expr::ScalarExpr;
use super::operators::{
    DistinctOperator,
    FilterOperator,
    LimitOperator,
    ProjectionOperator,
    SortKey,
    SortOperator,
};
use super::{GeneratedPipeline, PipelineGenerator};
use crate::condition::Condition;
use crate::graph::LocalGraph;
use crate::query::SqlQuery;
use crate::types::{Field, RowSchema};

pub const DEFAULT_INPUT_CAPACITY: usize = 1024;

pub const INPUT_STEP: &str = "input";

/// Generates [`LocalGraph`]s.
#[derive(Debug, Clone)]
pub struct LocalPipelineGenerator {
    input_capacity: usize,
}

impl Default for LocalPipelineGenerator {
    fn default() -> Self {
        LocalPipelineGenerator {
            input_capacity: DEFAULT_INPUT_CAPACITY,
        }
    }
}

impl LocalPipelineGenerator {
    pub fn new(input_capacity: usize) -> Self {
        LocalPipelineGenerator { input_capacity }
    }
}

/// Error if the condition references fields missing from the schema.
fn validate_fields(condition: &Condition, schema: &RowSchema, clause: &str) -> Result<()> {
    for field in condition.used_fields() {
        if schema.index_of(&field).is_none() {
            return Err(DbError::new(format!(
                "Unknown field '{field}' in {clause} clause"
            )));
        }
    }
    Ok(())
}

/// Combine the query's own LIMIT with the row cap.
fn effective_limit(sql_limit: Option<u64>, row_limit: usize) -> Option<usize> {
    let cap = (row_limit > 0).then_some(row_limit);
    match (sql_limit.map(|l| l as usize), cap) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl PipelineGenerator for LocalPipelineGenerator {
    fn generate(
        &self,
        query: &SqlQuery,
        input_schema: &RowSchema,
        row_limit: usize,
    ) -> Result<GeneratedPipeline> {
        let name = format!("sql_{}", query.service_name().unwrap_or("query"));
        let mut builder =
            LocalGraph::builder(name).queue_source(INPUT_STEP, input_schema.clone(), self.input_capacity);
        let mut schema = input_schema.clone();

        if let Some(condition) = &query.where_condition {
            validate_fields(condition, &schema, "WHERE")?;
            builder = builder.step(
                "filter",
                schema.clone(),
                FilterOperator::new(condition.clone(), schema.clone()),
            );
        }

        if let Some(plan) = AggregatePlan::plan(query, &schema)? {
            schema = plan.output_schema.clone();
            builder = builder.step("aggregate", schema.clone(), AggregateOperator::new(&plan));

            if let Some(condition) = &query.having_condition {
                validate_fields(condition, &schema, "HAVING")?;
                builder = builder.step(
                    "having",
                    schema.clone(),
                    FilterOperator::new(condition.clone(), schema.clone()),
                );
            }
        }

        let mut exprs = Vec::new();
        let mut fields = Vec::new();
        for item in query.select_items() {
            match item {
                SelectItem::Wildcard => {
                    for (idx, field) in schema.fields.iter().enumerate() {
                        exprs.push(ScalarExpr::Column(idx));
                        fields.push(field.clone());
                    }
                }
                SelectItem::Expr(expr) | SelectItem::AliasedExpr(expr, _) => {
                    let compiled = ScalarExpr::compile(expr, &schema)?;
                    let name = item.output_name().unwrap_or_else(|| expr.to_string());
                    fields.push(Field::new(name, compiled.datatype(&schema)));
                    exprs.push(compiled);
                }
            }
        }
        schema = RowSchema::new(fields);
        builder = builder.step("project", schema.clone(), ProjectionOperator::new(exprs));

        if query.is_distinct() {
            builder = builder.step("distinct", schema.clone(), DistinctOperator::default());
        }

        if !query.order_by().is_empty() {
            let mut keys = Vec::with_capacity(query.order_by().len());
            for order_by in query.order_by() {
                let column = order_by
                    .expr
                    .column_name()
                    .and_then(|name| schema.index_of(name))
                    .or_else(|| schema.index_of(&order_by.expr.to_string()))
                    .ok_or_else(|| {
                        DbError::new(format!(
                            "ORDER BY expression '{}' must appear in the select list",
                            order_by.expr
                        ))
                    })?;
                keys.push(SortKey {
                    column,
                    asc: order_by.asc,
                });
            }
            builder = builder.step("sort", schema.clone(), SortOperator::new(keys));
        }

        if let Some(limit) = effective_limit(query.limit(), row_limit) {
            builder = builder.step("limit", schema.clone(), LimitOperator::new(limit));
        }

        let graph = builder.build()?;
        let result_step = graph.result_step().to_string();
        debug!(graph = %graph.result_step(), output = %schema, "generated pipeline");

        Ok(GeneratedPipeline {
            graph: graph.into_shared(),
            input_step: INPUT_STEP.to_string(),
            result_step,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::{DataType, Row, ScalarValue};

    fn input_schema() -> RowSchema {
        RowSchema::new([
            Field::new("region", DataType::String),
            Field::new("amount", DataType::Integer),
        ])
    }

    fn rows() -> Vec<Row> {
        vec![
            vec!["EU".into(), 10.into()],
            vec!["US".into(), 20.into()],
            vec!["EU".into(), 30.into()],
            vec!["APAC".into(), 5.into()],
        ]
    }

    fn run(sql: &str, row_limit: usize) -> (RowSchema, Vec<Row>) {
        let query = SqlQuery::parse(sql).unwrap();
        let pipeline = LocalPipelineGenerator::default()
            .generate(&query, &input_schema(), row_limit)
            .unwrap();
        let graph = pipeline.graph;

        let results = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = results.clone();
        graph
            .add_row_listener(
                &pipeline.result_step,
                std::sync::Arc::new(move |row: &Row| {
                    sink.lock().push(row.clone());
                    Ok(())
                }),
            )
            .unwrap();

        let producer = graph.row_producer(&pipeline.input_step).unwrap();
        graph.start().unwrap();
        for row in rows() {
            if producer.put_row_wait(row, Duration::from_secs(5)).is_err() {
                break;
            }
        }
        producer.finish();
        graph.wait_until_finished().unwrap();

        let schema = graph.step_schema(&pipeline.result_step).unwrap();
        let rows = results.lock().clone();
        (schema, rows)
    }

    #[test]
    fn filter_and_project() {
        let (schema, rows) = run("SELECT UPPER(region) AS r, amount * 2 FROM s WHERE amount > 10", 0);
        assert_eq!(vec!["r", "amount * 2"], schema.names().collect::<Vec<_>>());
        assert_eq!(
            vec![
                vec![ScalarValue::from("US"), ScalarValue::Integer(40)],
                vec![ScalarValue::from("EU"), ScalarValue::Integer(60)],
            ],
            rows
        );
    }

    #[test]
    fn group_having_order() {
        let (_, rows) = run(
            "SELECT region, SUM(amount) AS total FROM s GROUP BY region HAVING COUNT(*) >= 1 ORDER BY total DESC",
            0,
        );
        assert_eq!(
            vec![
                vec![ScalarValue::from("EU"), ScalarValue::Integer(40)],
                vec![ScalarValue::from("US"), ScalarValue::Integer(20)],
                vec![ScalarValue::from("APAC"), ScalarValue::Integer(5)],
            ],
            rows
        );
    }

    #[test]
    fn row_cap_and_limit() {
        let (_, rows) = run("SELECT * FROM s", 2);
        assert_eq!(2, rows.len());
        let (_, rows) = run("SELECT * FROM s LIMIT 1", 3);
        assert_eq!(1, rows.len());
        let (_, rows) = run("SELECT DISTINCT region FROM s", 0);
        assert_eq!(3, rows.len());
    }

    #[test]
    fn unknown_fields_rejected() {
        let generator = LocalPipelineGenerator::default();
        for sql in [
            "SELECT * FROM s WHERE missing = 1",
            "SELECT missing FROM s",
            "SELECT region FROM s ORDER BY amount",
        ] {
            let query = SqlQuery::parse(sql).unwrap();
            generator.generate(&query, &input_schema(), 0).unwrap_err();
        }
    }

    #[test]
    fn limits() {
        assert_eq!(None, effective_limit(None, 0));
        assert_eq!(Some(5), effective_limit(None, 5));
        assert_eq!(Some(3), effective_limit(Some(3), 5));
        assert_eq!(Some(0), effective_limit(Some(0), 0));
    }
}
