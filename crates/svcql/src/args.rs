use std::path::PathBuf;

use clap::Args;
use svcql_core::config::host::{GatherMetrics, HandoffTimeout, HostConfig, HostSetting, RowLimit, TimeLimit};
use svcql_core::config::{CacheConfig, ExecutionConfig};
use svcql_error::{Result, ResultExt};

/// Host settings shared by every command.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// JSON file describing the available services.
    #[arg(short, long, env = "SVCQL_SERVICES")]
    pub services: PathBuf,

    /// Properties file with `svcql.*` settings.
    #[arg(long, env = "SVCQL_PROPERTIES")]
    pub properties: Option<PathBuf>,

    /// System wide row limit. Overrides the properties file.
    #[arg(long, env = "SVCQL_ROW_LIMIT")]
    pub system_row_limit: Option<i64>,

    /// System wide time limit in milliseconds.
    #[arg(long, env = "SVCQL_TIME_LIMIT")]
    pub system_time_limit: Option<i64>,

    /// Milliseconds a row handoff between graphs waits before rechecking.
    #[arg(long, env = "SVCQL_HANDOFF_TIMEOUT")]
    pub handoff_timeout: Option<u64>,

    /// Collect per step row counts.
    #[arg(long, env = "SVCQL_GATHER_METRICS")]
    pub gather_metrics: bool,

    /// Most entries kept in each executor cache map.
    #[arg(long, default_value_t = svcql_core::config::cache::DEFAULT_CACHE_MAX_ENTRIES)]
    pub cache_max_entries: usize,

    /// Seconds a cached query or stream may sit idle before eviction.
    #[arg(long, default_value_t = 600)]
    pub cache_idle_secs: u64,
}

impl ConfigArgs {
    /// Host configuration from the properties file with flags and
    /// environment variables applied on top.
    pub fn host_config(&self) -> Result<HostConfig> {
        let mut config = match &self.properties {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .context_fn(|| format!("Failed to read properties file {}", path.display()))?;
                HostConfig::from_properties(&text)?
            }
            None => HostConfig::new(),
        };
        if let Some(v) = self.system_row_limit {
            config.set(RowLimit::NAME, v.to_string());
        }
        if let Some(v) = self.system_time_limit {
            config.set(TimeLimit::NAME, v.to_string());
        }
        if let Some(v) = self.handoff_timeout {
            config.set(HandoffTimeout::NAME, v.to_string());
        }
        if self.gather_metrics {
            config.set(GatherMetrics::NAME, "true");
        }
        Ok(config)
    }

    pub fn execution_config(&self) -> Result<ExecutionConfig> {
        Ok(ExecutionConfig::from_host(&self.host_config()?))
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.cache_max_entries,
            expire_after_access: std::time::Duration::from_secs(self.cache_idle_secs),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct QueryArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Row limit for this query.
    #[arg(long)]
    pub row_limit: Option<i64>,

    /// Parameters passed to the source graph, `name=value`.
    #[arg(short, long = "param", value_parser = parse_parameter)]
    pub params: Vec<(String, String)>,

    /// Query to run.
    pub sql: String,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:7654")]
    pub listen: String,
}

fn parse_parameter(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("Expected name=value, got '{s}'"))
}
