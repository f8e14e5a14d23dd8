use std::time::Duration;

use super::host::{GatherMetrics, HandoffTimeout, HostConfig, Metastore, RowLimit, TimeLimit};

/// Row cap applied when no positive limit is configured anywhere.
pub const DEFAULT_ROW_LIMIT: usize = 50_000;

/// Time cap in milliseconds applied to streaming windows when no positive
/// limit is configured.
pub const DEFAULT_TIME_LIMIT_MS: u64 = 10_000;

pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_millis(500);

/// Typed view of the host configuration used while building queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// System wide row limit.
    pub row_limit: Option<i64>,
    /// System wide time limit in milliseconds.
    pub time_limit_ms: Option<i64>,
    pub handoff_timeout: Duration,
    pub gather_metrics: bool,
    pub metastore: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            row_limit: None,
            time_limit_ms: None,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
            gather_metrics: false,
            metastore: None,
        }
    }
}

impl ExecutionConfig {
    pub fn from_host(host: &HostConfig) -> Self {
        ExecutionConfig {
            row_limit: host.get::<RowLimit>(),
            time_limit_ms: host.get::<TimeLimit>(),
            handoff_timeout: host
                .get::<HandoffTimeout>()
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_HANDOFF_TIMEOUT),
            gather_metrics: host.get::<GatherMetrics>().unwrap_or(false),
            metastore: host.get::<Metastore>(),
        }
    }
}

/// Smallest of the positive values, if any.
pub fn min_positive(values: impl IntoIterator<Item = Option<i64>>) -> Option<i64> {
    values.into_iter().flatten().filter(|v| *v > 0).min()
}

/// Row and time caps computed for a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    /// Maximum rows, 0 means unbounded.
    pub row_limit: usize,
    pub time_limit_ms: u64,
}

impl QueryLimits {
    /// Compute the caps from the caller, service and system limits.
    ///
    /// The smallest positive value wins. With nothing positive, batch queries
    /// use [`DEFAULT_ROW_LIMIT`] unless the service is user defined in which
    /// case they're unbounded. Streaming queries always fall back to the
    /// default.
    pub fn resolve(
        caller: (Option<i64>, Option<i64>),
        service: (Option<i64>, Option<i64>),
        system: (Option<i64>, Option<i64>),
        streaming: bool,
        user_defined: bool,
    ) -> Self {
        let row_limit = match min_positive([caller.0, service.0, system.0]) {
            Some(limit) => limit as usize,
            None if streaming => DEFAULT_ROW_LIMIT,
            None if user_defined => 0,
            None => DEFAULT_ROW_LIMIT,
        };
        let time_limit_ms = match min_positive([caller.1, service.1, system.1]) {
            Some(limit) => limit as u64,
            None => DEFAULT_TIME_LIMIT_MS,
        };
        QueryLimits {
            row_limit,
            time_limit_ms,
        }
    }
}
