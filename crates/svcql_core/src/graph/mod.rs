//! Execution graphs and the handles used to wire them together.
pub mod local;
pub mod operator;
pub mod queue;
pub mod source;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use svcql_error::{DbError, Result};

use crate::types::{Parameters, Row, RowSchema};

pub use local::{LocalGraph, LocalGraphBuilder};
pub use queue::RowQueue;

pub type ListenerId = u64;

/// Callback invoked for every row written by a step.
pub type RowCallback = Arc<dyn Fn(&Row) -> Result<()> + Send + Sync>;

/// One-shot callback for step and graph completion.
pub type FinishedCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Nothing,
    Error,
    Minimal,
    #[default]
    Basic,
    Detailed,
    Debug,
    Rowlevel,
}

impl LogLevel {
    pub fn from_name(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "nothing" => LogLevel::Nothing,
            "error" => LogLevel::Error,
            "minimal" => LogLevel::Minimal,
            "basic" => LogLevel::Basic,
            "detailed" => LogLevel::Detailed,
            "debug" => LogLevel::Debug,
            "rowlevel" => LogLevel::Rowlevel,
            other => return Err(DbError::new(format!("Unknown log level: {other}"))),
        })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Settings applied to a graph before it's prepared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSettings {
    pub gather_metrics: bool,
    pub metastore: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepMetrics {
    pub step: String,
    pub rows_written: u64,
}

/// Input side of a graph that accepts rows from elsewhere.
pub trait RowProducer: Send + Sync + Debug {
    /// Offer a row, waiting at most `timeout` for room.
    ///
    /// Returns `Ok(false)` if the row wasn't accepted in time. Errors if the
    /// consuming side has gone away.
    fn put_row_wait(&self, row: Row, timeout: Duration) -> Result<bool>;

    /// Signal that no more rows will be produced.
    fn finish(&self);
}

/// A dataflow graph with named steps.
///
/// Graphs are shared between threads, all methods take `&self`.
pub trait ExecutionGraph: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn run_id(&self) -> String;
    fn set_run_id(&self, run_id: String);

    fn configure(&self, settings: GraphSettings);

    fn log_level(&self) -> LogLevel;
    fn set_log_level(&self, level: LogLevel);

    /// Merge parameters into the graph. Takes effect on start.
    fn set_parameters(&self, parameters: &Parameters);
    fn parameters(&self) -> Parameters;

    fn prepare(&self) -> Result<()>;
    fn start(&self) -> Result<()>;

    /// Request the graph stop. Does nothing if the graph isn't running.
    fn stop(&self);

    fn is_running(&self) -> bool;
    /// True once the graph has completed, either normally or by stopping.
    fn is_finished(&self) -> bool;
    fn is_stopped(&self) -> bool;

    /// Number of errors raised while running.
    fn errors(&self) -> usize;
    fn error_messages(&self) -> Vec<String>;

    fn step_names(&self) -> Vec<String>;
    fn step_schema(&self, step: &str) -> Result<RowSchema>;

    fn add_row_listener(&self, step: &str, listener: RowCallback) -> Result<ListenerId>;
    fn remove_row_listener(&self, step: &str, id: ListenerId);

    /// Run `callback` once the step has written its last row. Runs
    /// immediately if the step already finished.
    fn on_step_finished(&self, step: &str, callback: FinishedCallback) -> Result<()>;

    /// Run `callback` once the graph completes. Runs immediately if it
    /// already completed.
    fn on_finished(&self, callback: FinishedCallback);

    /// Producer feeding the given input step.
    fn row_producer(&self, step: &str) -> Result<Arc<dyn RowProducer>>;

    fn metrics(&self) -> Vec<StepMetrics>;

    /// Block until the graph completes.
    fn wait_until_finished(&self) -> Result<()>;
}
