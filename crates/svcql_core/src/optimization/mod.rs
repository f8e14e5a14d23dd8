//! Push-down optimizations that can change how a query is executed before
//! the full source graph runs.
pub mod parameters;

use std::fmt::{self, Debug};
use std::sync::Arc;

use svcql_error::Result;

use crate::execution::QueryOrchestrator;

pub use parameters::ParameterGeneration;

pub trait PushDownOptimization: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Apply the optimization to a built orchestrator, typically by
    /// registering tasks for the OPTIMIZE phase.
    ///
    /// Returns `true` if the optimization applies to this query.
    fn activate(&self, orchestrator: &QueryOrchestrator) -> Result<bool>;
}

/// An optimization attached to a service.
#[derive(Clone)]
pub struct OptimizationMeta {
    pub name: String,
    pub enabled: bool,
    pub optimization: Arc<dyn PushDownOptimization>,
}

impl OptimizationMeta {
    pub fn new(optimization: impl PushDownOptimization + 'static) -> Self {
        OptimizationMeta {
            name: optimization.name().to_string(),
            enabled: true,
            optimization: Arc::new(optimization),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl Debug for OptimizationMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizationMeta")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}
