//! Turns a parsed query into the graph that filters, aggregates and projects
//! a service's rows.
pub mod aggregate;
pub mod expr;
pub mod local;
pub mod operators;

use std::fmt::Debug;
use std::sync::Arc;

use svcql_error::Result;

use crate::graph::ExecutionGraph;
use crate::query::SqlQuery;
use crate::types::RowSchema;

pub use local::LocalPipelineGenerator;

/// A graph generated for a query along with the steps used to feed it and
/// read its results.
#[derive(Debug, Clone)]
pub struct GeneratedPipeline {
    pub graph: Arc<dyn ExecutionGraph>,
    pub input_step: String,
    pub result_step: String,
}

pub trait PipelineGenerator: Send + Sync + Debug {
    /// Build a graph for `query` reading rows shaped like `input_schema`.
    ///
    /// `row_limit` caps the number of result rows, 0 means unbounded.
    fn generate(
        &self,
        query: &SqlQuery,
        input_schema: &RowSchema,
        row_limit: usize,
    ) -> Result<GeneratedPipeline>;
}
