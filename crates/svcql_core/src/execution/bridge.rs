//! Forwards rows from the source graph into the generated graph.
use std::sync::Arc;
use std::time::Duration;

use svcql_error::Result;
use tracing::{debug, trace};

use crate::graph::{ExecutionGraph, ListenerId, RowProducer};
use crate::types::Row;

#[derive(Debug, Clone)]
pub struct RowBridge {
    pub source: Arc<dyn ExecutionGraph>,
    pub source_step: String,
    pub generated: Arc<dyn ExecutionGraph>,
    pub input_step: String,
    pub result_step: String,
    /// How long a single handoff attempt waits for room in the input.
    pub handoff_timeout: Duration,
}

impl RowBridge {
    /// Wire the two graphs together.
    ///
    /// Rows written by the source step are handed to the generated graph's
    /// input, blocking the source while the input is full. Once the
    /// generated graph completes, remaining rows are dropped. The source is
    /// stopped when the result step finishes or the generated graph
    /// completes, and the generated input gets end-of-stream once the source
    /// step finishes or the source graph completes.
    pub fn install(&self) -> Result<ListenerId> {
        let producer = self.generated.row_producer(&self.input_step)?;

        let listener_producer = producer.clone();
        let generated = self.generated.clone();
        let timeout = self.handoff_timeout;
        let id = self.source.add_row_listener(
            &self.source_step,
            Arc::new(move |row: &Row| {
                handoff(listener_producer.as_ref(), generated.as_ref(), row, timeout);
                Ok(())
            }),
        )?;

        let source = self.source.clone();
        self.generated.on_step_finished(
            &self.result_step,
            Box::new(move || {
                if source.is_running() {
                    debug!(graph = %source.name(), "result step finished, stopping source graph");
                    source.stop();
                }
            }),
        )?;
        // Step callbacks don't run when the generated graph stops or fails.
        let source = self.source.clone();
        self.generated.on_finished(Box::new(move || {
            if source.is_running() {
                debug!(graph = %source.name(), "generated graph completed, stopping source graph");
                source.stop();
            }
        }));

        let end_of_step = producer.clone();
        self.source
            .on_step_finished(&self.source_step, Box::new(move || end_of_step.finish()))?;
        // Covers the source stopping before its step finished.
        self.source.on_finished(Box::new(move || producer.finish()));

        Ok(id)
    }
}

fn handoff(producer: &dyn RowProducer, generated: &dyn ExecutionGraph, row: &Row, timeout: Duration) {
    loop {
        match producer.put_row_wait(row.clone(), timeout) {
            Ok(true) => return,
            Ok(false) => {
                if generated.is_finished() {
                    trace!(graph = %generated.name(), "generated graph completed, dropping row");
                    return;
                }
                trace!(graph = %generated.name(), "input full, retrying handoff");
            }
            Err(e) => {
                trace!(graph = %generated.name(), error = %e, "input no longer accepting rows");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use svcql_error::DbError;

    use super::*;
    use crate::generator::operators::LimitOperator;
    use crate::graph::LocalGraph;
    use crate::graph::source::MemorySource;
    use crate::types::{DataType, Field, RowSchema, ScalarValue};

    fn schema() -> RowSchema {
        RowSchema::new([Field::new("n", DataType::Integer)])
    }

    fn source(rows: i64) -> Arc<dyn ExecutionGraph> {
        let rows = (0..rows).map(|n| vec![ScalarValue::Integer(n)]).collect();
        LocalGraph::builder("source")
            .source("numbers", schema(), MemorySource::new(schema(), rows))
            .build()
            .unwrap()
            .into_shared()
    }

    fn generated(limit: usize) -> Arc<dyn ExecutionGraph> {
        LocalGraph::builder("generated")
            .queue_source("input", schema(), 4)
            .step("limit", schema(), LimitOperator::new(limit))
            .build()
            .unwrap()
            .into_shared()
    }

    fn bridge(source: &Arc<dyn ExecutionGraph>, generated: &Arc<dyn ExecutionGraph>) -> RowBridge {
        RowBridge {
            source: source.clone(),
            source_step: "numbers".to_string(),
            generated: generated.clone(),
            input_step: "input".to_string(),
            result_step: "limit".to_string(),
            handoff_timeout: Duration::from_millis(20),
        }
    }

    fn collect(graph: &Arc<dyn ExecutionGraph>, step: &str) -> Arc<Mutex<Vec<Row>>> {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let sink = rows.clone();
        graph
            .add_row_listener(
                step,
                Arc::new(move |row: &Row| {
                    sink.lock().push(row.clone());
                    Ok(())
                }),
            )
            .unwrap();
        rows
    }

    #[test]
    fn forwards_all_rows() {
        let source = source(100);
        let generated = generated(1000);
        bridge(&source, &generated).install().unwrap();
        let rows = collect(&generated, "limit");

        generated.start().unwrap();
        source.start().unwrap();
        generated.wait_until_finished().unwrap();
        source.wait_until_finished().unwrap();

        assert_eq!(100, rows.lock().len());
        assert_eq!(0, source.errors());
        assert_eq!(0, generated.errors());
    }

    #[test]
    fn limit_stops_source() {
        let source = source(10_000);
        let generated = generated(5);
        bridge(&source, &generated).install().unwrap();
        let rows = collect(&generated, "limit");

        generated.start().unwrap();
        source.start().unwrap();
        generated.wait_until_finished().unwrap();
        source.wait_until_finished().unwrap();

        assert_eq!(5, rows.lock().len());
        assert_eq!(0, source.errors());
    }

    #[test]
    fn failed_generated_graph_stops_source() {
        // Cycles through its rows until stopped.
        let rows = (0..10).map(|n| vec![ScalarValue::Integer(n)]).collect();
        let source = LocalGraph::builder("source")
            .source(
                "numbers",
                schema(),
                MemorySource::new(schema(), rows).with_interval(Duration::from_millis(1)),
            )
            .build()
            .unwrap()
            .into_shared();
        let generated = generated(1000);
        bridge(&source, &generated).install().unwrap();
        generated
            .add_row_listener(
                "limit",
                Arc::new(|_row: &Row| Err(DbError::new("result writer closed"))),
            )
            .unwrap();

        generated.start().unwrap();
        source.start().unwrap();
        generated.wait_until_finished().unwrap();
        source.wait_until_finished().unwrap();

        assert_eq!(1, generated.errors());
        assert!(source.is_stopped());
    }

    #[test]
    fn empty_source_finishes_generated() {
        let source = source(0);
        let generated = generated(10);
        bridge(&source, &generated).install().unwrap();

        generated.start().unwrap();
        source.start().unwrap();
        generated.wait_until_finished().unwrap();
        assert!(!generated.is_stopped());
    }
}
