pub mod cache;
pub mod execution;
pub mod host;

pub use cache::CacheConfig;
pub use execution::{ExecutionConfig, QueryLimits};
pub use host::{HostConfig, HostSetting};
