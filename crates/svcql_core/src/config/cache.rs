use std::time::Duration;

pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_CACHE_EXPIRE_AFTER_ACCESS: Duration = Duration::from_secs(10 * 60);

/// Bounds for each map held by the executor cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Entries not accessed for this long are evicted.
    pub expire_after_access: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            expire_after_access: DEFAULT_CACHE_EXPIRE_AFTER_ACCESS,
        }
    }
}
