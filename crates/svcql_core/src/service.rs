//! Description of a service a query can be run against.
use crate::optimization::OptimizationMeta;

#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Step in the source graph whose rows back the service.
    pub source_step: String,
    pub streaming: bool,
    pub row_limit: Option<i64>,
    /// Time limit in milliseconds.
    pub time_limit_ms: Option<i64>,
    /// Authored by a user rather than generated.
    pub user_defined: bool,
    pub optimizations: Vec<OptimizationMeta>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, source_step: impl Into<String>) -> Self {
        ServiceDescriptor {
            name: name.into(),
            source_step: source_step.into(),
            streaming: false,
            row_limit: None,
            time_limit_ms: None,
            user_defined: false,
            optimizations: Vec::new(),
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_row_limit(mut self, limit: i64) -> Self {
        self.row_limit = Some(limit);
        self
    }

    pub fn with_time_limit(mut self, limit_ms: i64) -> Self {
        self.time_limit_ms = Some(limit_ms);
        self
    }

    pub fn with_user_defined(mut self, user_defined: bool) -> Self {
        self.user_defined = user_defined;
        self
    }

    pub fn with_optimization(mut self, optimization: OptimizationMeta) -> Self {
        self.optimizations.push(optimization);
        self
    }

    /// Names of the enabled optimizations, in order.
    pub fn active_optimizations(&self) -> Vec<String> {
        self.optimizations
            .iter()
            .filter(|o| o.enabled)
            .map(|o| o.name.clone())
            .collect()
    }
}
