use std::sync::Arc;

use svcql_core::cache::ExecutorCache;
use svcql_core::config::ExecutionConfig;
use svcql_core::execution::QueryOrchestrator;
use svcql_core::optimization::OptimizationMeta;
use svcql_core::optimization::parameters::ParameterGeneration;
use svcql_core::protocol::RowStreamReader;
use svcql_core::testutil;
use svcql_core::types::{DataType, Row, ScalarValue};

fn run(orchestrator: &QueryOrchestrator) -> (Vec<(String, DataType)>, Vec<Row>) {
    let bytes = orchestrator.execute_binary(Vec::new()).unwrap();
    let mut reader = RowStreamReader::new(bytes.as_slice());
    reader.read_preamble().unwrap();
    let result = reader.read_to_end().unwrap();
    let schema = result
        .schema
        .map(|s| {
            s.fields
                .iter()
                .map(|f| (f.name.clone(), f.datatype))
                .collect()
        })
        .unwrap_or_default();
    (schema, result.rows)
}

#[test]
fn filter_and_aggregate() {
    let cache = Arc::new(ExecutorCache::default());
    let orchestrator = QueryOrchestrator::builder(
        "SELECT region, COUNT(*) AS n, SUM(amount) AS total FROM sales \
         WHERE amount >= '10' GROUP BY region HAVING SUM(amount) > 25 ORDER BY region",
        testutil::sales_service(),
        cache,
    )
    .source_graph(testutil::sales_graph())
    .build()
    .unwrap();

    let (schema, rows) = run(&orchestrator);
    assert_eq!(
        vec![
            ("region".to_string(), DataType::String),
            ("n".to_string(), DataType::Integer),
            ("total".to_string(), DataType::Integer),
        ],
        schema
    );
    assert_eq!(
        vec![vec![
            ScalarValue::from("EU"),
            ScalarValue::Integer(2),
            ScalarValue::Integer(40)
        ]],
        rows
    );
}

#[test]
fn empty_result_still_has_schema() {
    let orchestrator = QueryOrchestrator::builder(
        "SELECT region FROM sales WHERE amount > 1000",
        testutil::sales_service(),
        Arc::new(ExecutorCache::default()),
    )
    .source_graph(testutil::sales_graph())
    .build()
    .unwrap();

    let (schema, rows) = run(&orchestrator);
    assert_eq!(vec![("region".to_string(), DataType::String)], schema);
    assert!(rows.is_empty());
}

#[test]
fn caller_row_limit_caps_output() {
    let orchestrator = QueryOrchestrator::builder(
        "SELECT * FROM sales",
        testutil::sales_service().with_row_limit(3),
        Arc::new(ExecutorCache::default()),
    )
    .row_limit(2)
    .source_graph(testutil::sales_graph())
    .build()
    .unwrap();
    assert_eq!(2, orchestrator.limits().row_limit);

    let (_, rows) = run(&orchestrator);
    assert_eq!(2, rows.len());
    orchestrator.source_graph().wait_until_finished().unwrap();
}

#[test]
fn parameter_predicate_filters_at_source() {
    let orchestrator = QueryOrchestrator::builder(
        "SELECT amount FROM sales WHERE PARAMETER('region') = 'EU'",
        testutil::sales_service(),
        Arc::new(ExecutorCache::default()),
    )
    .source_graph(testutil::sales_graph())
    .build()
    .unwrap();

    let (_, rows) = run(&orchestrator);
    assert_eq!(
        vec![vec![ScalarValue::Integer(10)], vec![ScalarValue::Integer(30)]],
        rows
    );
}

#[test]
fn pushed_down_equality_reaches_source() {
    let service = testutil::sales_service().with_optimization(OptimizationMeta::new(
        ParameterGeneration::new().with_mapping("region", "region"),
    ));
    let orchestrator = QueryOrchestrator::builder(
        "SELECT region, amount FROM sales WHERE region = 'US'",
        service,
        Arc::new(ExecutorCache::default()),
    )
    .config(ExecutionConfig {
        gather_metrics: true,
        ..Default::default()
    })
    .source_graph(testutil::sales_graph())
    .build()
    .unwrap();

    let (_, rows) = run(&orchestrator);
    assert_eq!(
        vec![vec![ScalarValue::from("US"), ScalarValue::Integer(20)]],
        rows
    );
    assert_eq!(
        Some("US".to_string()),
        orchestrator.source_graph().parameters().get("region").cloned()
    );
    // Only the source's own row reaches the generated graph.
    let metrics = orchestrator.source_graph().metrics();
    assert_eq!(1, metrics[0].rows_written);
}

#[test]
fn disabled_optimization_not_applied() {
    let service = testutil::sales_service().with_optimization(
        OptimizationMeta::new(ParameterGeneration::new().with_mapping("region", "region"))
            .disabled(),
    );
    let orchestrator = QueryOrchestrator::builder(
        "SELECT region FROM sales WHERE region = 'US'",
        service,
        Arc::new(ExecutorCache::default()),
    )
    .source_graph(testutil::sales_graph())
    .build()
    .unwrap();

    let (_, rows) = run(&orchestrator);
    assert_eq!(1, rows.len());
    assert!(orchestrator.source_graph().parameters().is_empty());
}

#[test]
fn same_id_returns_registered_query() {
    let cache = Arc::new(ExecutorCache::default());
    let first = QueryOrchestrator::builder("SELECT * FROM sales", testutil::sales_service(), cache.clone())
        .id("shared")
        .source_graph(testutil::sales_graph())
        .build()
        .unwrap();
    let second = QueryOrchestrator::builder(
        "SELECT region FROM sales",
        testutil::sales_service(),
        cache.clone(),
    )
    .id("shared")
    .source_graph(testutil::sales_graph())
    .build()
    .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(1, cache.executor_count());
}
