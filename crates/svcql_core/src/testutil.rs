//! Fixtures shared by unit and integration tests.
use std::sync::Arc;
use std::time::Duration;

use crate::graph::source::MemorySource;
use crate::graph::{ExecutionGraph, LocalGraph};
use crate::service::ServiceDescriptor;
use crate::types::{DataType, Field, Row, RowSchema};

pub const SALES_STEP: &str = "sales";

pub fn sales_schema() -> RowSchema {
    RowSchema::new([
        Field::new("region", DataType::String),
        Field::new("amount", DataType::Integer),
    ])
}

pub fn sales_rows() -> Vec<Row> {
    vec![
        vec!["EU".into(), 10.into()],
        vec!["US".into(), 20.into()],
        vec!["EU".into(), 30.into()],
        vec!["APAC".into(), 5.into()],
    ]
}

pub fn sales_service() -> ServiceDescriptor {
    ServiceDescriptor::new("sales", SALES_STEP)
}

/// Batch source emitting [`sales_rows`] once, filtered on parameters named
/// after a field.
pub fn sales_graph() -> Arc<dyn ExecutionGraph> {
    let source = MemorySource::new(sales_schema(), sales_rows()).with_parameter_filter();
    graph_with_source("sales_source", source)
}

pub fn sales_stream_service() -> ServiceDescriptor {
    ServiceDescriptor::new("sales", SALES_STEP).with_streaming(true)
}

/// Never ending source cycling through [`sales_rows`], one row per
/// `interval`.
pub fn sales_stream_graph(interval: Duration) -> Arc<dyn ExecutionGraph> {
    let source = MemorySource::new(sales_schema(), sales_rows())
        .with_interval(interval)
        .with_parameter_filter();
    graph_with_source("sales_stream", source)
}

/// Stream fed by hand through the graph's row producer for [`SALES_STEP`].
/// Ends once the producer is finished.
pub fn sales_feed_graph(capacity: usize) -> Arc<dyn ExecutionGraph> {
    match LocalGraph::builder("sales_feed")
        .queue_source(SALES_STEP, sales_schema(), capacity)
        .build()
    {
        Ok(graph) => graph.into_shared(),
        Err(e) => panic!("failed to build test graph: {e}"),
    }
}

fn graph_with_source(name: &str, source: MemorySource) -> Arc<dyn ExecutionGraph> {
    match LocalGraph::builder(name)
        .source(SALES_STEP, sales_schema(), source)
        .build()
    {
        Ok(graph) => graph.into_shared(),
        Err(e) => panic!("failed to build test graph: {e}"),
    }
}
