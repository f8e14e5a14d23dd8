//! In-process execution graph running a linear chain of steps on a single
//! worker thread.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use svcql_error::{DbError, OptionExt, Result};
use tracing::{debug, error, info, trace};

use super::operator::{OperatorState, RowOperator};
use super::queue::RowQueue;
use super::source::{QueueSource, RowSource, SourcePoll};
use super::{
    ExecutionGraph,
    FinishedCallback,
    GraphSettings,
    ListenerId,
    LogLevel,
    RowCallback,
    RowProducer,
    StepMetrics,
};
use crate::types::{Parameters, Row, RowSchema};

/// How long the worker waits on its source before checking for a stop
/// request.
const SOURCE_POLL_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GraphState {
    Created,
    Prepared,
    Running,
    Finished,
    Stopped,
}

struct StateInner {
    state: GraphState,
    on_finished: Vec<FinishedCallback>,
}

#[derive(Default)]
struct StepListeners {
    rows: Arc<Vec<(ListenerId, RowCallback)>>,
    on_finished: Vec<FinishedCallback>,
    finished: bool,
}

#[derive(Debug)]
struct StepMeta {
    name: String,
    schema: RowSchema,
}

#[derive(Debug)]
struct Pipeline {
    source: Box<dyn RowSource>,
    /// Operator for each step after the first.
    operators: Vec<Box<dyn RowOperator>>,
}

#[derive(Debug)]
pub struct LocalGraphBuilder {
    name: String,
    source: Option<(StepMeta, Box<dyn RowSource>)>,
    input: Option<Arc<RowQueue>>,
    steps: Vec<(StepMeta, Box<dyn RowOperator>)>,
}

impl LocalGraphBuilder {
    /// Set the first step of the graph.
    pub fn source(
        mut self,
        step: impl Into<String>,
        schema: RowSchema,
        source: impl RowSource + 'static,
    ) -> Self {
        let meta = StepMeta {
            name: step.into(),
            schema,
        };
        self.source = Some((meta, Box::new(source)));
        self
    }

    /// Use a bounded input queue as the first step. Rows are fed through
    /// [`ExecutionGraph::row_producer`].
    pub fn queue_source(self, step: impl Into<String>, schema: RowSchema, capacity: usize) -> Self {
        let queue = Arc::new(RowQueue::new(capacity));
        let mut builder = self.source(step, schema, QueueSource::new(queue.clone()));
        builder.input = Some(queue);
        builder
    }

    /// Append a step.
    pub fn step(
        mut self,
        step: impl Into<String>,
        schema: RowSchema,
        operator: impl RowOperator + 'static,
    ) -> Self {
        let meta = StepMeta {
            name: step.into(),
            schema,
        };
        self.steps.push((meta, Box::new(operator)));
        self
    }

    pub fn build(self) -> Result<LocalGraph> {
        let (source_meta, source) = self
            .source
            .ok_or_else(|| DbError::new(format!("Graph '{}' has no source step", self.name)))?;

        let mut steps = vec![source_meta];
        let mut operators = Vec::with_capacity(self.steps.len());
        for (meta, operator) in self.steps {
            if steps.iter().any(|s| s.name == meta.name) {
                return Err(DbError::new(format!(
                    "Duplicate step name '{}' in graph '{}'",
                    meta.name, self.name
                )));
            }
            steps.push(meta);
            operators.push(operator);
        }

        let listeners = steps.iter().map(|_| StepListeners::default()).collect();
        let rows_written = steps.iter().map(|_| AtomicU64::new(0)).collect();

        Ok(LocalGraph {
            inner: Arc::new(GraphInner {
                name: self.name,
                steps,
                input: self.input,
                run_id: Mutex::new(String::new()),
                settings: Mutex::new(GraphSettings::default()),
                log_level: Mutex::new(LogLevel::default()),
                parameters: Mutex::new(Parameters::new()),
                state: Mutex::new(StateInner {
                    state: GraphState::Created,
                    on_finished: Vec::new(),
                }),
                state_changed: Condvar::new(),
                stop_requested: AtomicBool::new(false),
                errors: Mutex::new(Vec::new()),
                listeners: Mutex::new(listeners),
                next_listener_id: AtomicU64::new(0),
                rows_written,
                pipeline: Mutex::new(Some(Pipeline { source, operators })),
            }),
        })
    }
}

/// Execution graph backed by a worker thread in this process.
///
/// Cheap to clone, clones share the same graph.
#[derive(Debug, Clone)]
pub struct LocalGraph {
    inner: Arc<GraphInner>,
}

struct GraphInner {
    name: String,
    steps: Vec<StepMeta>,
    input: Option<Arc<RowQueue>>,
    run_id: Mutex<String>,
    settings: Mutex<GraphSettings>,
    log_level: Mutex<LogLevel>,
    parameters: Mutex<Parameters>,
    state: Mutex<StateInner>,
    state_changed: Condvar,
    stop_requested: AtomicBool,
    errors: Mutex<Vec<DbError>>,
    listeners: Mutex<Vec<StepListeners>>,
    next_listener_id: AtomicU64,
    rows_written: Vec<AtomicU64>,
    /// Taken by the worker on start.
    pipeline: Mutex<Option<Pipeline>>,
}

impl fmt::Debug for GraphInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphInner")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("state", &self.state.try_lock().map(|s| s.state))
            .finish_non_exhaustive()
    }
}

impl LocalGraph {
    pub fn builder(name: impl Into<String>) -> LocalGraphBuilder {
        LocalGraphBuilder {
            name: name.into(),
            source: None,
            input: None,
            steps: Vec::new(),
        }
    }

    /// Name of the first step.
    pub fn source_step(&self) -> &str {
        &self.inner.steps[0].name
    }

    /// Name of the last step.
    pub fn result_step(&self) -> &str {
        &self.inner.steps[self.inner.steps.len() - 1].name
    }

    pub fn into_shared(self) -> Arc<dyn ExecutionGraph> {
        Arc::new(self)
    }
}

impl GraphInner {
    fn step_index(&self, step: &str) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.name == step)
            .ok_or_else(|| DbError::new(format!("Unknown step '{step}' in graph '{}'", self.name)))
    }

    fn run(&self, pipeline: Pipeline) {
        let Pipeline {
            mut source,
            mut operators,
        } = pipeline;

        let parameters = self.parameters.lock().clone();
        let result = self.execute(source.as_mut(), &mut operators, &parameters);
        source.close();

        let stopped = match result {
            Ok(()) => self.stop_requested.load(Ordering::Acquire),
            Err(e) => {
                error!(graph = %self.name, error = %e, "graph failed");
                self.errors.lock().push(e);
                true
            }
        };

        self.complete(if stopped {
            GraphState::Stopped
        } else {
            GraphState::Finished
        });
    }

    fn execute(
        &self,
        source: &mut dyn RowSource,
        operators: &mut [Box<dyn RowOperator>],
        parameters: &Parameters,
    ) -> Result<()> {
        source.open(parameters)?;

        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return Ok(());
            }
            match source.poll_row(SOURCE_POLL_TIMEOUT)? {
                SourcePoll::Row(row) => {
                    if self.deliver(operators, 0, row)? == OperatorState::Done {
                        debug!(graph = %self.name, "downstream step done, no longer reading source");
                        break;
                    }
                }
                SourcePoll::Idle => continue,
                SourcePoll::Exhausted => break,
            }
        }
        self.mark_step_finished(0);

        for idx in 1..self.steps.len() {
            if self.stop_requested.load(Ordering::Acquire) {
                return Ok(());
            }
            let mut out = Vec::new();
            operators[idx - 1].finish(&mut out)?;
            for row in out {
                let _ = self.deliver(operators, idx, row)?;
            }
            self.mark_step_finished(idx);
        }

        Ok(())
    }

    /// Publish a row written by step `idx` and push it through the rest of
    /// the chain.
    fn deliver(
        &self,
        operators: &mut [Box<dyn RowOperator>],
        idx: usize,
        row: Row,
    ) -> Result<OperatorState> {
        self.publish_row(idx, &row)?;

        if idx + 1 >= self.steps.len() {
            return Ok(OperatorState::NeedsMore);
        }

        let mut out = Vec::new();
        let mut state = operators[idx].push(row, &mut out)?;
        for row in out {
            if self.deliver(operators, idx + 1, row)? == OperatorState::Done {
                state = OperatorState::Done;
            }
        }
        Ok(state)
    }

    fn publish_row(&self, idx: usize, row: &Row) -> Result<()> {
        self.rows_written[idx].fetch_add(1, Ordering::Relaxed);
        if *self.log_level.lock() >= LogLevel::Rowlevel {
            trace!(graph = %self.name, step = %self.steps[idx].name, ?row, "row written");
        }

        let listeners = self.listeners.lock()[idx].rows.clone();
        for (id, listener) in listeners.iter() {
            listener(row).map_err(|e| {
                DbError::with_source(
                    format!(
                        "Row listener {id} on step '{}' failed",
                        self.steps[idx].name
                    ),
                    Box::new(e),
                )
            })?;
        }
        Ok(())
    }

    fn mark_step_finished(&self, idx: usize) {
        let callbacks = {
            let mut listeners = self.listeners.lock();
            listeners[idx].finished = true;
            std::mem::take(&mut listeners[idx].on_finished)
        };
        debug!(graph = %self.name, step = %self.steps[idx].name, "step finished");
        for callback in callbacks {
            callback();
        }
    }

    /// Run the graph finished callbacks then publish the final state.
    ///
    /// Callbacks run before waiters are released. Callbacks registered while
    /// the first batch runs are picked up when the state is published.
    fn complete(&self, final_state: GraphState) {
        // Step callbacks that never ran won't run now.
        for listeners in self.listeners.lock().iter_mut() {
            listeners.on_finished.clear();
        }

        if *self.log_level.lock() >= LogLevel::Minimal {
            info!(graph = %self.name, state = ?final_state, errors = self.errors.lock().len(), "graph completed");
        }

        let callbacks = std::mem::take(&mut self.state.lock().on_finished);
        for callback in callbacks {
            callback();
        }

        let late = {
            let mut state = self.state.lock();
            state.state = final_state;
            self.state_changed.notify_all();
            std::mem::take(&mut state.on_finished)
        };
        for callback in late {
            callback();
        }
    }
}

impl ExecutionGraph for LocalGraph {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn run_id(&self) -> String {
        self.inner.run_id.lock().clone()
    }

    fn set_run_id(&self, run_id: String) {
        *self.inner.run_id.lock() = run_id;
    }

    fn configure(&self, settings: GraphSettings) {
        if let Some(metastore) = &settings.metastore {
            debug!(graph = %self.inner.name, %metastore, "using metastore");
        }
        *self.inner.settings.lock() = settings;
    }

    fn log_level(&self) -> LogLevel {
        *self.inner.log_level.lock()
    }

    fn set_log_level(&self, level: LogLevel) {
        *self.inner.log_level.lock() = level;
    }

    fn set_parameters(&self, parameters: &Parameters) {
        let mut current = self.inner.parameters.lock();
        for (name, value) in parameters {
            current.insert(name.clone(), value.clone());
        }
    }

    fn parameters(&self) -> Parameters {
        self.inner.parameters.lock().clone()
    }

    fn prepare(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.state {
            GraphState::Created => {
                state.state = GraphState::Prepared;
                debug!(graph = %self.inner.name, "graph prepared");
                Ok(())
            }
            GraphState::Prepared => Ok(()),
            other => Err(DbError::new(format!(
                "Cannot prepare graph '{}' in state {other:?}",
                self.inner.name
            ))),
        }
    }

    fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match state.state {
                GraphState::Created | GraphState::Prepared => (),
                other => {
                    return Err(DbError::new(format!(
                        "Cannot start graph '{}' in state {other:?}",
                        self.inner.name
                    )));
                }
            }
            state.state = GraphState::Running;
        }

        let pipeline = self.inner.pipeline.lock().take().required("graph pipeline")?;
        self.inner.stop_requested.store(false, Ordering::Release);

        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("svcql_graph_{}", self.inner.name))
            .spawn(move || inner.run(pipeline));

        if let Err(e) = spawned {
            self.inner.errors.lock().push(DbError::with_source(
                "Failed to spawn graph worker thread",
                Box::new(e),
            ));
            self.inner.complete(GraphState::Stopped);
            return Err(DbError::new(format!(
                "Failed to start graph '{}'",
                self.inner.name
            )));
        }

        debug!(graph = %self.inner.name, run_id = %self.run_id(), "graph started");
        Ok(())
    }

    fn stop(&self) {
        if !self.is_running() {
            return;
        }
        debug!(graph = %self.inner.name, "stop requested");
        self.inner.stop_requested.store(true, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.inner.state.lock().state == GraphState::Running
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.inner.state.lock().state,
            GraphState::Finished | GraphState::Stopped
        )
    }

    fn is_stopped(&self) -> bool {
        self.inner.state.lock().state == GraphState::Stopped
    }

    fn errors(&self) -> usize {
        self.inner.errors.lock().len()
    }

    fn error_messages(&self) -> Vec<String> {
        self.inner.errors.lock().iter().map(|e| e.to_string()).collect()
    }

    fn step_names(&self) -> Vec<String> {
        self.inner.steps.iter().map(|s| s.name.clone()).collect()
    }

    fn step_schema(&self, step: &str) -> Result<RowSchema> {
        let idx = self.inner.step_index(step)?;
        Ok(self.inner.steps[idx].schema.clone())
    }

    fn add_row_listener(&self, step: &str, listener: RowCallback) -> Result<ListenerId> {
        let idx = self.inner.step_index(step)?;
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);

        let mut listeners = self.inner.listeners.lock();
        let mut rows = listeners[idx].rows.as_ref().clone();
        rows.push((id, listener));
        listeners[idx].rows = Arc::new(rows);

        Ok(id)
    }

    fn remove_row_listener(&self, step: &str, id: ListenerId) {
        let idx = match self.inner.step_index(step) {
            Ok(idx) => idx,
            Err(_) => return,
        };
        let mut listeners = self.inner.listeners.lock();
        let rows: Vec<_> = listeners[idx]
            .rows
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        listeners[idx].rows = Arc::new(rows);
    }

    fn on_step_finished(&self, step: &str, callback: FinishedCallback) -> Result<()> {
        let idx = self.inner.step_index(step)?;
        {
            let mut listeners = self.inner.listeners.lock();
            if !listeners[idx].finished {
                listeners[idx].on_finished.push(callback);
                return Ok(());
            }
        }
        callback();
        Ok(())
    }

    fn on_finished(&self, callback: FinishedCallback) {
        {
            let mut state = self.inner.state.lock();
            if !matches!(state.state, GraphState::Finished | GraphState::Stopped) {
                state.on_finished.push(callback);
                return;
            }
        }
        callback();
    }

    fn row_producer(&self, step: &str) -> Result<Arc<dyn RowProducer>> {
        let idx = self.inner.step_index(step)?;
        match &self.inner.input {
            Some(queue) if idx == 0 => {
                let producer: Arc<dyn RowProducer> = queue.clone();
                Ok(producer)
            }
            _ => Err(DbError::new(format!(
                "Step '{step}' in graph '{}' does not accept input rows",
                self.inner.name
            ))),
        }
    }

    fn metrics(&self) -> Vec<StepMetrics> {
        if !self.inner.settings.lock().gather_metrics {
            return Vec::new();
        }
        self.inner
            .steps
            .iter()
            .zip(&self.inner.rows_written)
            .map(|(step, rows)| StepMetrics {
                step: step.name.clone(),
                rows_written: rows.load(Ordering::Relaxed),
            })
            .collect()
    }

    fn wait_until_finished(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        loop {
            match state.state {
                GraphState::Finished | GraphState::Stopped => return Ok(()),
                GraphState::Running => self.inner.state_changed.wait(&mut state),
                GraphState::Created | GraphState::Prepared => {
                    return Err(DbError::new(format!(
                        "Graph '{}' has not been started",
                        self.inner.name
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::graph::source::MemorySource;
    use crate::types::{DataType, Field, ScalarValue};

    fn schema() -> RowSchema {
        RowSchema::new([Field::new("n", DataType::Integer)])
    }

    fn numbers(n: i64) -> Vec<Row> {
        (0..n).map(|v| vec![ScalarValue::Integer(v)]).collect()
    }

    /// Doubles every value, stops after `limit` outputs.
    #[derive(Debug)]
    struct Doubler {
        limit: usize,
        seen: usize,
    }

    impl RowOperator for Doubler {
        fn push(&mut self, row: Row, out: &mut Vec<Row>) -> Result<OperatorState> {
            if self.seen >= self.limit {
                return Ok(OperatorState::Done);
            }
            self.seen += 1;
            let v = match &row[0] {
                ScalarValue::Integer(v) => *v,
                _ => 0,
            };
            out.push(vec![ScalarValue::Integer(v * 2)]);
            Ok(if self.seen >= self.limit {
                OperatorState::Done
            } else {
                OperatorState::NeedsMore
            })
        }

        fn finish(&mut self, _out: &mut Vec<Row>) -> Result<()> {
            Ok(())
        }
    }

    fn collect_rows(graph: &LocalGraph, step: &str) -> mpsc::Receiver<Row> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        graph
            .add_row_listener(
                step,
                Arc::new(move |row: &Row| {
                    let _ = tx.lock().send(row.clone());
                    Ok(())
                }),
            )
            .unwrap();
        rx
    }

    #[test]
    fn runs_to_completion() {
        let graph = LocalGraph::builder("test")
            .source("input", schema(), MemorySource::new(schema(), numbers(5)))
            .step("double", schema(), Doubler { limit: 100, seen: 0 })
            .build()
            .unwrap();

        let rx = collect_rows(&graph, "double");
        graph.prepare().unwrap();
        graph.start().unwrap();
        graph.wait_until_finished().unwrap();

        assert!(graph.is_finished());
        assert!(!graph.is_stopped());
        let rows: Vec<_> = rx.try_iter().collect();
        assert_eq!(5, rows.len());
        assert_eq!(vec![ScalarValue::Integer(8)], rows[4]);
    }

    #[test]
    fn done_operator_stops_reading() {
        let graph = LocalGraph::builder("test")
            .source("input", schema(), MemorySource::new(schema(), numbers(100)))
            .step("double", schema(), Doubler { limit: 3, seen: 0 })
            .build()
            .unwrap();
        let rx = collect_rows(&graph, "input");
        graph.start().unwrap();
        graph.wait_until_finished().unwrap();
        assert_eq!(3, rx.try_iter().count());
    }

    #[test]
    fn finished_callbacks_fire_once_and_late_ones_immediately() {
        let graph = LocalGraph::builder("test")
            .source("input", schema(), MemorySource::new(schema(), numbers(1)))
            .build()
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let early = tx.clone();
        graph.on_finished(Box::new(move || early.send("early").unwrap()));
        graph.start().unwrap();
        graph.wait_until_finished().unwrap();

        let late = tx.clone();
        graph.on_finished(Box::new(move || late.send("late").unwrap()));
        graph
            .on_step_finished("input", Box::new(move || tx.send("step").unwrap()))
            .unwrap();
        assert_eq!(vec!["early", "late", "step"], rx.try_iter().collect::<Vec<_>>());
    }

    #[test]
    fn stop_queue_graph() {
        let graph = LocalGraph::builder("test")
            .queue_source("input", schema(), 4)
            .build()
            .unwrap();
        graph.stop();
        assert!(!graph.is_stopped());

        graph.start().unwrap();
        assert!(graph.is_running());
        graph.stop();
        graph.wait_until_finished().unwrap();
        assert!(graph.is_stopped());
        graph.stop();
    }

    #[test]
    fn producer_feeds_queue_graph() {
        let graph = LocalGraph::builder("test")
            .queue_source("input", schema(), 2)
            .build()
            .unwrap();
        let rx = collect_rows(&graph, "input");
        let producer = graph.row_producer("input").unwrap();
        graph.start().unwrap();
        for row in numbers(10) {
            assert!(producer.put_row_wait(row, Duration::from_secs(5)).unwrap());
        }
        producer.finish();
        graph.wait_until_finished().unwrap();
        assert_eq!(10, rx.try_iter().count());
    }

    #[test]
    fn failing_listener_counts_error() {
        let graph = LocalGraph::builder("test")
            .source("input", schema(), MemorySource::new(schema(), numbers(3)))
            .build()
            .unwrap();
        graph
            .add_row_listener("input", Arc::new(|_row: &Row| Err::<(), _>(DbError::new("boom"))))
            .unwrap();
        graph.start().unwrap();
        graph.wait_until_finished().unwrap();
        assert_eq!(1, graph.errors());
        assert!(graph.is_stopped());
    }

    #[test]
    fn removed_listener_sees_nothing() {
        let graph = LocalGraph::builder("test")
            .source("input", schema(), MemorySource::new(schema(), numbers(3)))
            .build()
            .unwrap();
        let (tx, rx) = mpsc::channel::<Row>();
        let tx = Mutex::new(tx);
        let id = graph
            .add_row_listener(
                "input",
                Arc::new(move |row: &Row| {
                    let _ = tx.lock().send(row.clone());
                    Ok(())
                }),
            )
            .unwrap();
        graph.remove_row_listener("input", id);
        graph.start().unwrap();
        graph.wait_until_finished().unwrap();
        assert_eq!(0, rx.try_iter().count());
    }

    #[test]
    fn unknown_step() {
        let graph = LocalGraph::builder("test")
            .source("input", schema(), MemorySource::new(schema(), numbers(1)))
            .build()
            .unwrap();
        graph.step_schema("nope").unwrap_err();
        graph.row_producer("input").unwrap_err();
        graph.wait_until_finished().unwrap_err();
    }
}
