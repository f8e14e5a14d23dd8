use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use svcql_error::{DbError, Result};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::bridge::RowBridge;
use super::phase::{ExecutionPoint, ListenerMap, TaskOutcome};
use super::signal::StartupSignal;
use crate::cache::ExecutorCache;
use crate::condition::Condition;
use crate::condition::resolve::{ConditionResolver, extract_parameters};
use crate::config::{ExecutionConfig, QueryLimits};
use crate::generator::aggregate::AggregatePlan;
use crate::generator::{GeneratedPipeline, LocalPipelineGenerator, PipelineGenerator};
use crate::graph::{ExecutionGraph, GraphSettings, LogLevel, RowProducer};
use crate::protocol::codec::{QueryPreamble, RowStreamWriter};
use crate::query::SqlQuery;
use crate::service::ServiceDescriptor;
use crate::streaming::{StreamingKey, WindowConfig, WindowManager, WindowPublisher};
use crate::types::{Parameters, Row};

fn no_source_graph(service: &str) -> DbError {
    DbError::new(format!("No source graph available for service '{service}'"))
        .with_field("service", service)
}

/// Builds a [`QueryOrchestrator`].
#[derive(Debug)]
pub struct OrchestratorBuilder {
    sql: String,
    service: ServiceDescriptor,
    cache: Arc<ExecutorCache>,
    id: Option<String>,
    source: Option<Arc<dyn ExecutionGraph>>,
    generator: Arc<dyn PipelineGenerator>,
    parameters: Parameters,
    row_limit: Option<i64>,
    time_limit_ms: Option<i64>,
    config: ExecutionConfig,
    log_level: Option<LogLevel>,
    window: WindowConfig,
    prepare: bool,
}

impl OrchestratorBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn source_graph(mut self, graph: Arc<dyn ExecutionGraph>) -> Self {
        self.source = Some(graph);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn PipelineGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn parameters(mut self, parameters: &Parameters) -> Self {
        for (name, value) in parameters {
            self.parameters.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn row_limit(mut self, limit: i64) -> Self {
        self.row_limit = Some(limit);
        self
    }

    pub fn time_limit(mut self, limit_ms: i64) -> Self {
        self.time_limit_ms = Some(limit_ms);
        self
    }

    pub fn config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn window(mut self, window: WindowConfig) -> Self {
        self.window = window;
        self
    }

    /// Skip running the PREPARE phase on build.
    pub fn skip_prepare(mut self) -> Self {
        self.prepare = false;
        self
    }

    pub fn build(mut self) -> Result<Arc<QueryOrchestrator>> {
        let mut query = SqlQuery::parse(&self.sql)?;
        query.validate_service(&self.service.name)?;

        let limits = QueryLimits::resolve(
            (self.row_limit, self.time_limit_ms),
            (self.service.row_limit, self.service.time_limit_ms),
            (self.config.row_limit, self.config.time_limit_ms),
            self.service.streaming,
            self.service.user_defined,
        );

        // Parameters are part of the streaming key so pull them out before
        // looking up the window manager.
        let mut parameters = std::mem::take(&mut self.parameters);
        for condition in [&mut query.where_condition, &mut query.having_condition]
            .into_iter()
            .flatten()
        {
            extract_parameters(condition, &mut parameters);
        }

        let mut window_manager = None;
        let source = if self.service.streaming {
            let manager = self.window_manager(&parameters, limits)?;
            let source = manager.source_graph().clone();
            window_manager = Some(manager);
            source
        } else {
            self.source
                .clone()
                .ok_or_else(|| no_source_graph(&self.service.name))?
        };

        let source_schema = source.step_schema(&self.service.source_step)?;
        if let Some(condition) = &mut query.where_condition {
            let report = ConditionResolver::new(&source_schema).resolve(condition, &mut parameters);
            debug!(?report, "resolved WHERE condition");
        }
        if query.having_condition.is_some() {
            if let Some(plan) = AggregatePlan::plan(&query, &source_schema)? {
                if let Some(condition) = &mut query.having_condition {
                    let report = ConditionResolver::new(&plan.output_schema)
                        .resolve(condition, &mut parameters);
                    debug!(?report, "resolved HAVING condition");
                }
            }
        }

        let pipeline = self
            .generator
            .generate(&query, &source_schema, limits.row_limit)?;

        let settings = GraphSettings {
            gather_metrics: self.config.gather_metrics,
            metastore: self.config.metastore.clone(),
        };
        let run_id = Uuid::new_v4().to_string();
        pipeline.graph.set_run_id(run_id.clone());
        pipeline.graph.configure(settings.clone());
        if !self.service.streaming {
            // The shared streaming source keeps the run id it was started with.
            source.set_run_id(Uuid::new_v4().to_string());
            source.configure(settings);
        }

        // Defaults to the generated run id, which clients read from the
        // preamble.
        let id = self.id.unwrap_or(run_id);
        let orchestrator = Arc::new(QueryOrchestrator {
            id: id.clone(),
            service: self.service,
            query,
            parameters,
            limits,
            config: self.config,
            source,
            pipeline,
            window: self.window,
            window_manager,
            cache: self.cache.clone(),
            listeners: ListenerMap::new(),
            startup: Arc::new(StartupSignal::new()),
            subscription: Arc::new(Mutex::new(None)),
            stopped: Arc::new(AtomicBool::new(false)),
            prepared: AtomicBool::new(false),
        });

        let registered = self
            .cache
            .insert_executor_if_absent(id.clone(), orchestrator.clone());
        if !Arc::ptr_eq(&registered, &orchestrator) {
            debug!(%id, "query already registered, using existing instance");
            return Ok(registered);
        }

        if let Some(level) = self.log_level {
            if !orchestrator.is_streaming() {
                orchestrator.source.set_log_level(level);
            }
            orchestrator.pipeline.graph.set_log_level(level);
        }

        info!(
            %id,
            service = %orchestrator.service.name,
            streaming = orchestrator.is_streaming(),
            row_limit = limits.row_limit,
            "built query"
        );

        if self.prepare {
            orchestrator.prepare_execution()?;
        }

        Ok(orchestrator)
    }

    /// Find the window manager for the streaming key, creating and starting
    /// one from the supplied source graph if none is cached.
    fn window_manager(&self, parameters: &Parameters, limits: QueryLimits) -> Result<Arc<WindowManager>> {
        let key = StreamingKey::new(
            &self.service.name,
            parameters,
            self.service.active_optimizations(),
        );
        if let Some(existing) = self.cache.window_manager(&key) {
            if !existing.is_finished() {
                debug!(%key, "attaching to running stream");
                return Ok(existing);
            }
            info!(%key, "cached stream has finished, starting a new one");
            self.cache.remove_finished_window_manager(&key);
        }

        let source = self
            .source
            .clone()
            .ok_or_else(|| no_source_graph(&self.service.name))?;
        let created = Arc::new(WindowManager::new(
            key.clone(),
            source,
            &self.service.source_step,
            limits,
        ));
        let winner = self
            .cache
            .insert_window_manager_if_absent(key.clone(), created.clone());
        if Arc::ptr_eq(&winner, &created) {
            if let Err(e) = created.start() {
                self.cache.remove_window_manager(&key);
                return Err(e);
            }
        }
        Ok(winner)
    }
}

/// A streaming query's input waiting on a publisher for its window.
#[derive(Debug)]
struct WindowSubscription {
    publisher: Arc<WindowPublisher>,
    consumer: Arc<dyn RowProducer>,
}

fn release_subscription(slot: &Mutex<Option<WindowSubscription>>) {
    if let Some(subscription) = slot.lock().take() {
        if subscription.publisher.unsubscribe(&subscription.consumer) {
            debug!("released pending window subscription");
        }
    }
}

/// Coordinates the source graph and generated graph of a single query.
#[derive(Debug)]
pub struct QueryOrchestrator {
    id: String,
    service: ServiceDescriptor,
    query: SqlQuery,
    parameters: Parameters,
    limits: QueryLimits,
    config: ExecutionConfig,
    source: Arc<dyn ExecutionGraph>,
    pipeline: GeneratedPipeline,
    window: WindowConfig,
    window_manager: Option<Arc<WindowManager>>,
    cache: Arc<ExecutorCache>,
    listeners: ListenerMap,
    startup: Arc<StartupSignal>,
    subscription: Arc<Mutex<Option<WindowSubscription>>>,
    stopped: Arc<AtomicBool>,
    prepared: AtomicBool,
}

impl QueryOrchestrator {
    pub fn builder(
        sql: impl Into<String>,
        service: ServiceDescriptor,
        cache: Arc<ExecutorCache>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            sql: sql.into(),
            service,
            cache,
            id: None,
            source: None,
            generator: Arc::new(LocalPipelineGenerator::default()),
            parameters: Parameters::new(),
            row_limit: None,
            time_limit_ms: None,
            config: ExecutionConfig::default(),
            log_level: None,
            window: WindowConfig::default(),
            prepare: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    pub fn query(&self) -> &SqlQuery {
        &self.query
    }

    pub fn where_condition(&self) -> Option<&Condition> {
        self.query.where_condition.as_ref()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    pub fn is_streaming(&self) -> bool {
        self.service.streaming
    }

    pub fn source_graph(&self) -> &Arc<dyn ExecutionGraph> {
        &self.source
    }

    pub fn generated_graph(&self) -> &Arc<dyn ExecutionGraph> {
        &self.pipeline.graph
    }

    pub fn pipeline(&self) -> &GeneratedPipeline {
        &self.pipeline
    }

    pub fn window_manager(&self) -> Option<&Arc<WindowManager>> {
        self.window_manager.as_ref()
    }

    pub fn listeners(&self) -> &ListenerMap {
        &self.listeners
    }

    /// Name shown for a run of one of the graphs.
    pub fn display_name(&self, graph: &dyn ExecutionGraph) -> String {
        format!("{} - {}", self.service.name, graph.name())
    }

    /// Register the PREPARE tasks, plus READY and START tasks for batch
    /// queries, and run the PREPARE phase. Does nothing if already prepared.
    pub fn prepare_execution(&self) -> Result<()> {
        if self.prepared.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let generated = self.pipeline.graph.clone();
        if self.is_streaming() {
            // The shared source is already running under the window manager.
            let parameters = self.parameters.clone();
            self.listeners.add(ExecutionPoint::Prepare, move || {
                generated.set_parameters(&parameters);
                generated.prepare()?;
                Ok(TaskOutcome::Remove)
            });
        } else {
            let source = self.source.clone();
            let parameters = self.parameters.clone();
            self.listeners.add(ExecutionPoint::Prepare, move || {
                source.set_parameters(&parameters);
                source.prepare()?;
                Ok(TaskOutcome::Remove)
            });

            let prepare_generated = generated.clone();
            self.listeners.add(ExecutionPoint::Prepare, move || {
                prepare_generated.prepare()?;
                Ok(TaskOutcome::Remove)
            });

            let bridge = RowBridge {
                source: self.source.clone(),
                source_step: self.service.source_step.clone(),
                generated: generated.clone(),
                input_step: self.pipeline.input_step.clone(),
                result_step: self.pipeline.result_step.clone(),
                handoff_timeout: self.config.handoff_timeout,
            };
            self.listeners.add(ExecutionPoint::Ready, move || {
                bridge.install()?;
                Ok(TaskOutcome::Remove)
            });

            // Start the consuming side first.
            self.listeners.add(ExecutionPoint::Start, move || {
                generated.start()?;
                Ok(TaskOutcome::Remove)
            });
            let source = self.source.clone();
            self.listeners.add(ExecutionPoint::Start, move || {
                source.start()?;
                Ok(TaskOutcome::Remove)
            });
        }

        self.listeners.run(ExecutionPoint::Prepare)?;
        Ok(())
    }

    /// Run the query's phases in order.
    pub fn execute_query(&self) -> Result<()> {
        self.prepare_execution()?;

        if self.is_streaming() {
            self.attach_window()?;
        } else {
            for meta in self.service.optimizations.iter().filter(|o| o.enabled) {
                if meta.optimization.activate(self)? {
                    info!(id = %self.id, optimization = %meta.name, "activated optimization");
                }
            }
        }

        for point in ExecutionPoint::ALL {
            let report = self.listeners.run(point)?;
            debug!(id = %self.id, phase = %point, ran = report.ran, "ran phase");
        }
        Ok(())
    }

    /// Register the READY task that starts the generated graph and feeds it
    /// a window of the shared stream.
    fn attach_window(&self) -> Result<()> {
        let manager = self
            .window_manager
            .clone()
            .ok_or_else(|| DbError::new("Streaming query has no window manager"))?;
        let generated = self.pipeline.graph.clone();
        let producer = generated.row_producer(&self.pipeline.input_step)?;
        let cache = self.cache.clone();
        let window = self.window;
        let handoff_timeout = self.config.handoff_timeout;
        let startup = self.startup.clone();
        let subscription = self.subscription.clone();
        let stopped = self.stopped.clone();

        let finished_subscription = self.subscription.clone();
        generated.on_finished(Box::new(move || release_subscription(&finished_subscription)));

        self.listeners.add(ExecutionPoint::Ready, move || {
            let attached: Result<()> = (|| {
                if stopped.load(Ordering::Acquire) {
                    return Err(DbError::new("Query stopped before it started"));
                }
                generated.start()?;
                let publisher = manager.publisher(&cache, window, handoff_timeout)?;
                startup.set();
                *subscription.lock() = Some(WindowSubscription {
                    publisher: publisher.clone(),
                    consumer: producer.clone(),
                });
                publisher.subscribe(producer.clone())?;
                // Stopped while subscribing.
                if stopped.load(Ordering::Acquire) {
                    generated.stop();
                    release_subscription(&subscription);
                }
                Ok(())
            })();
            if let Err(e) = &attached {
                startup.abort(e.to_string());
                producer.finish();
            }
            attached?;
            Ok(TaskOutcome::Remove)
        });
        Ok(())
    }

    /// Run the query, writing results to `writer` using the binary row
    /// format. Returns the writer once the query completes.
    ///
    /// The row schema is always written, even when the query produces no
    /// rows.
    pub fn execute_binary<W>(&self, writer: W) -> Result<W>
    where
        W: Write + Send + 'static,
    {
        let generated = self.pipeline.graph.clone();
        let schema = generated.step_schema(&self.pipeline.result_step)?;

        let mut stream = RowStreamWriter::new(writer, schema);
        stream.write_preamble(&QueryPreamble {
            service: self.service.name.clone(),
            source_name: self.display_name(self.source.as_ref()),
            source_run_id: self.source.run_id(),
            generated_name: self.display_name(generated.as_ref()),
            generated_run_id: generated.run_id(),
        })?;
        let stream = Arc::new(Mutex::new(stream));

        let row_stream = stream.clone();
        let listener = generated.add_row_listener(
            &self.pipeline.result_step,
            Arc::new(move |row: &Row| row_stream.lock().write_row(row)),
        )?;

        let finish_stream = stream.clone();
        let id = self.id.clone();
        generated.on_finished(Box::new(move || {
            if let Err(e) = finish_stream.lock().finish() {
                error!(%id, error = %e, "failed to finish row stream");
            }
        }));

        let result = self
            .execute_query()
            .and_then(|_| self.wait_until_finished());
        generated.remove_row_listener(&self.pipeline.result_step, listener);
        result?;

        match Arc::try_unwrap(stream) {
            Ok(stream) => Ok(stream.into_inner().into_inner()),
            Err(_) => Err(DbError::new("Row stream still in use after query completed")),
        }
    }

    /// Block until the query completes.
    ///
    /// For streaming queries this first waits for the generated graph to be
    /// started by its READY task. If that wait is interrupted the returned
    /// error is fatal.
    pub fn wait_until_finished(&self) -> Result<()> {
        if self.is_streaming() {
            self.startup.wait()?;
            return self.pipeline.graph.wait_until_finished();
        }
        self.pipeline.graph.wait_until_finished()?;
        self.source.wait_until_finished()
    }

    /// Stop whichever graphs are running.
    ///
    /// The shared source of a streaming query is owned by its window manager
    /// and is never stopped here.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if self.is_streaming() {
            self.startup.abort("query stopped");
            release_subscription(&self.subscription);
        } else if self.source.is_running() {
            self.source.stop();
        }
        if self.pipeline.graph.is_running() {
            self.pipeline.graph.stop();
        }
    }

    pub fn has_errors(&self) -> bool {
        self.source.errors() > 0 || self.pipeline.graph.errors() > 0
    }

    pub fn error_messages(&self) -> Vec<String> {
        let mut messages = self.source.error_messages();
        messages.extend(self.pipeline.graph.error_messages());
        messages
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::codec::RowStreamReader;
    use crate::testutil;
    use crate::types::ScalarValue;

    fn cache() -> Arc<ExecutorCache> {
        Arc::new(ExecutorCache::default())
    }

    #[test]
    fn service_name_mismatch_fails() {
        let err = QueryOrchestrator::builder(
            "SELECT * FROM other",
            testutil::sales_service(),
            cache(),
        )
        .source_graph(testutil::sales_graph())
        .build()
        .unwrap_err();
        assert_eq!(Some("sales"), err.get_field("service"));
    }

    #[test]
    fn missing_source_graph_fails() {
        QueryOrchestrator::builder("SELECT * FROM sales", testutil::sales_service(), cache())
            .build()
            .unwrap_err();
    }

    #[test]
    fn registered_before_execution() {
        let cache = cache();
        let orchestrator =
            QueryOrchestrator::builder("SELECT * FROM sales", testutil::sales_service(), cache.clone())
                .id("q1")
                .source_graph(testutil::sales_graph())
                .skip_prepare()
                .build()
                .unwrap();
        let cached = cache.executor("q1").unwrap();
        assert!(Arc::ptr_eq(&orchestrator, &cached));
        // Nothing registered yet.
        assert!(orchestrator.listeners().is_empty(ExecutionPoint::Prepare));
        assert!(orchestrator.listeners().is_empty(ExecutionPoint::Start));
    }

    #[test]
    fn prepare_registers_batch_phases() {
        let orchestrator =
            QueryOrchestrator::builder("SELECT * FROM sales", testutil::sales_service(), cache())
                .source_graph(testutil::sales_graph())
                .build()
                .unwrap();
        // PREPARE tasks removed themselves.
        assert!(orchestrator.listeners().is_empty(ExecutionPoint::Prepare));
        assert_eq!(1, orchestrator.listeners().len(ExecutionPoint::Ready));
        assert_eq!(2, orchestrator.listeners().len(ExecutionPoint::Start));
    }

    #[test]
    fn parameters_extracted_from_where() {
        let orchestrator = QueryOrchestrator::builder(
            "SELECT * FROM sales WHERE PARAMETER('region') = 'EU' AND amount > 1",
            testutil::sales_service(),
            cache(),
        )
        .source_graph(testutil::sales_graph())
        .build()
        .unwrap();
        assert_eq!(
            Some("EU"),
            orchestrator.parameters().get("region").map(|s| s.as_str())
        );
        assert_eq!(
            Some("EU".to_string()),
            orchestrator.source_graph().parameters().get("region").cloned()
        );
    }

    #[test]
    fn batch_query_with_binary_output() {
        let orchestrator = QueryOrchestrator::builder(
            "SELECT region, SUM(amount) AS total FROM sales GROUP BY region ORDER BY region",
            testutil::sales_service(),
            cache(),
        )
        .source_graph(testutil::sales_graph())
        .build()
        .unwrap();

        let bytes = orchestrator.execute_binary(Vec::new()).unwrap();
        let mut reader = RowStreamReader::new(bytes.as_slice());
        let preamble = reader.read_preamble().unwrap();
        assert_eq!("sales", preamble.service);
        assert_eq!(orchestrator.generated_graph().run_id(), preamble.generated_run_id);
        assert_eq!(orchestrator.source_graph().run_id(), preamble.source_run_id);

        let result = reader.read_to_end().unwrap();
        assert_eq!(1, result.metadata_blocks);
        assert_eq!(
            vec![
                vec![ScalarValue::from("APAC"), ScalarValue::Integer(5)],
                vec![ScalarValue::from("EU"), ScalarValue::Integer(40)],
                vec![ScalarValue::from("US"), ScalarValue::Integer(20)],
            ],
            result.rows
        );
        assert!(!orchestrator.has_errors());
    }

    #[test]
    fn id_defaults_to_generated_run_id() {
        let cache = cache();
        let orchestrator =
            QueryOrchestrator::builder("SELECT * FROM sales", testutil::sales_service(), cache.clone())
                .source_graph(testutil::sales_graph())
                .build()
                .unwrap();
        assert_eq!(orchestrator.generated_graph().run_id(), orchestrator.id());
        assert!(cache.executor(orchestrator.id()).is_some());
    }

    #[test]
    fn stop_before_ready_makes_wait_fatal() {
        let cache = cache();
        let orchestrator = QueryOrchestrator::builder(
            "SELECT * FROM sales",
            testutil::sales_stream_service(),
            cache.clone(),
        )
        .source_graph(testutil::sales_stream_graph(Duration::from_millis(5)))
        .build()
        .unwrap();

        orchestrator.stop();
        let err = orchestrator.wait_until_finished().unwrap_err();
        assert!(err.is_fatal());

        // READY backs out without starting the generated graph.
        orchestrator.execute_query().unwrap_err();
        assert!(!orchestrator.generated_graph().is_running());

        let manager = orchestrator.window_manager().unwrap().clone();
        cache.remove_window_manager(manager.key());
    }

    #[test]
    fn stop_without_running_graphs_is_noop() {
        let orchestrator =
            QueryOrchestrator::builder("SELECT * FROM sales", testutil::sales_service(), cache())
                .source_graph(testutil::sales_graph())
                .build()
                .unwrap();
        orchestrator.stop();
        orchestrator.stop();
        assert!(!orchestrator.source_graph().is_running());
        assert!(!orchestrator.has_errors());
    }
}
