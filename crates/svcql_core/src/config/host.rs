//! Host level configuration, a flat string map read from properties files
//! and the environment.
use std::collections::HashMap;

use svcql_error::{DbError, Result};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    values: HashMap<String, String>,
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` lines. Blank lines and lines starting with `#` or
    /// `!` are ignored.
    pub fn from_properties(text: &str) -> Result<Self> {
        let mut config = HostConfig::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .or_else(|| line.split_once(':'))
                .ok_or_else(|| {
                    DbError::new(format!("Invalid property on line {}: {line}", idx + 1))
                })?;
            config.set(key.trim(), value.trim());
        }
        Ok(config)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    /// Get a typed setting, checking its name then its aliases.
    ///
    /// A value that fails to parse is logged and treated as unset.
    pub fn get<S: HostSetting>(&self) -> Option<S::Value> {
        let (key, raw) = std::iter::once(S::NAME)
            .chain(S::ALIASES.iter().copied())
            .find_map(|key| self.get_raw(key).map(|raw| (key, raw)))?;

        match S::parse(raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(setting = key, value = raw, error = %e, "ignoring malformed setting");
                None
            }
        }
    }
}

pub trait HostSetting: Sync + Send + 'static {
    const NAME: &'static str;
    /// Older names still accepted for this setting.
    const ALIASES: &'static [&'static str] = &[];
    const DESCRIPTION: &'static str;

    type Value;

    fn parse(raw: &str) -> Result<Self::Value>;
}

pub struct RowLimit;

impl HostSetting for RowLimit {
    const NAME: &'static str = "svcql.row_limit";
    const ALIASES: &'static [&'static str] = &["svcql.rowlimit"];
    const DESCRIPTION: &'static str = "Maximum number of rows a query may return";

    type Value = i64;

    fn parse(raw: &str) -> Result<i64> {
        Ok(raw.trim().parse()?)
    }
}

pub struct TimeLimit;

impl HostSetting for TimeLimit {
    const NAME: &'static str = "svcql.time_limit";
    const DESCRIPTION: &'static str = "Time limit in milliseconds for streaming windows";

    type Value = i64;

    fn parse(raw: &str) -> Result<i64> {
        Ok(raw.trim().parse()?)
    }
}

pub struct HandoffTimeout;

impl HostSetting for HandoffTimeout {
    const NAME: &'static str = "svcql.handoff_timeout";
    const DESCRIPTION: &'static str =
        "Milliseconds a row handoff between graphs waits before checking the consumer";

    type Value = u64;

    fn parse(raw: &str) -> Result<u64> {
        let v: u64 = raw.trim().parse()?;
        if v == 0 {
            return Err(DbError::new("Handoff timeout must be greater than zero"));
        }
        Ok(v)
    }
}

pub struct GatherMetrics;

impl HostSetting for GatherMetrics {
    const NAME: &'static str = "svcql.gather_metrics";
    const DESCRIPTION: &'static str = "Collect per step row counts for executed graphs";

    type Value = bool;

    fn parse(raw: &str) -> Result<bool> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "y" | "yes" | "1" => Ok(true),
            "false" | "n" | "no" | "0" => Ok(false),
            other => Err(DbError::new(format!("Invalid boolean: {other}"))),
        }
    }
}

pub struct Metastore;

impl HostSetting for Metastore {
    const NAME: &'static str = "svcql.metastore";
    const DESCRIPTION: &'static str = "Location of the metadata store handed to graphs";

    type Value = String;

    fn parse(raw: &str) -> Result<String> {
        Ok(raw.trim().to_string())
    }
}

/// Name and description of every known setting.
pub fn describe_settings() -> Vec<(&'static str, &'static str)> {
    fn describe<S: HostSetting>() -> (&'static str, &'static str) {
        (S::NAME, S::DESCRIPTION)
    }
    vec![
        describe::<RowLimit>(),
        describe::<TimeLimit>(),
        describe::<HandoffTimeout>(),
        describe::<GatherMetrics>(),
        describe::<Metastore>(),
    ]
}
