use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::QueryLimits;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Size and interval count rows.
    #[default]
    Row,
    /// Size and interval are milliseconds.
    Time,
}

/// Slice of a shared stream delivered to a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub mode: WindowMode,
    /// Rows or milliseconds covered by a window. 0 uses the stream's caps.
    pub size: u64,
    /// Rows or milliseconds between windows. 0 makes windows tumble.
    pub every: u64,
    /// Max rows delivered per window, 0 for no limit.
    pub limit: u64,
}

impl WindowConfig {
    pub fn rows(size: u64) -> Self {
        WindowConfig {
            mode: WindowMode::Row,
            size,
            ..Default::default()
        }
    }

    pub fn time(size_ms: u64) -> Self {
        WindowConfig {
            mode: WindowMode::Time,
            size: size_ms,
            ..Default::default()
        }
    }

    pub fn with_every(mut self, every: u64) -> Self {
        self.every = every;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Fill in the unset values from the stream's caps.
    pub fn resolve(&self, limits: &QueryLimits) -> ResolvedWindow {
        let size = match (self.size, self.mode) {
            (0, WindowMode::Row) => limits.row_limit.max(1) as u64,
            (0, WindowMode::Time) => limits.time_limit_ms.max(1),
            (size, _) => size,
        };
        let every = if self.every == 0 { size } else { self.every };
        ResolvedWindow {
            mode: self.mode,
            size,
            every,
            limit: self.limit as usize,
            max_rows: limits.row_limit,
            time_limit: Duration::from_millis(limits.time_limit_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedWindow {
    pub mode: WindowMode,
    pub size: u64,
    pub every: u64,
    pub limit: usize,
    /// Most rows kept in memory, 0 for no cap.
    pub max_rows: usize,
    /// Row windows are flushed at least this often.
    pub time_limit: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tumbling_by_default() {
        let limits = QueryLimits {
            row_limit: 100,
            time_limit_ms: 5000,
        };
        let window = WindowConfig::rows(10).resolve(&limits);
        assert_eq!(10, window.every);

        let window = WindowConfig::default().resolve(&limits);
        assert_eq!(100, window.size);
        assert_eq!(100, window.every);

        let window = WindowConfig::time(0).with_every(250).resolve(&limits);
        assert_eq!(5000, window.size);
        assert_eq!(250, window.every);
    }
}
