use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use moka::notification::RemovalCause;
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::execution::QueryOrchestrator;
use crate::streaming::{StreamingKey, WindowConfig, WindowManager, WindowPublisher};

/// Identifies a window publisher: the stream and the window cut from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub stream: StreamingKey,
    pub window: WindowConfig,
}

impl WindowKey {
    pub fn new(stream: StreamingKey, window: WindowConfig) -> Self {
        WindowKey { stream, window }
    }
}

/// Process wide registry of query orchestrators, window managers and
/// window publishers.
///
/// Each map is bounded and expires entries that haven't been accessed for a
/// while. Evicted managers shut down their stream and evicted publishers
/// detach from it. Explicit removals tear down in the removing method
/// instead.
pub struct ExecutorCache {
    executors: Cache<String, Arc<QueryOrchestrator>>,
    window_managers: Cache<StreamingKey, Arc<WindowManager>>,
    windows: Cache<WindowKey, Arc<WindowPublisher>>,
}

impl fmt::Debug for ExecutorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorCache")
            .field("executors", &self.executors.entry_count())
            .field("window_managers", &self.window_managers.entry_count())
            .field("windows", &self.windows.entry_count())
            .finish()
    }
}

impl Default for ExecutorCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

fn builder<K, V>(config: CacheConfig) -> moka::sync::CacheBuilder<K, V, Cache<K, V>>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut builder = Cache::builder();
    if config.max_entries > 0 {
        builder = builder.max_capacity(config.max_entries as u64);
    }
    if !config.expire_after_access.is_zero() {
        builder = builder.time_to_idle(config.expire_after_access);
    }
    builder
}

impl ExecutorCache {
    pub fn new(config: CacheConfig) -> Self {
        let windows = builder(config)
            .eviction_listener(
                |key: Arc<WindowKey>, publisher: Arc<WindowPublisher>, cause: RemovalCause| {
                    if cause.was_evicted() {
                        debug!(stream = %key.stream, ?cause, "evicted window publisher");
                        publisher.detach();
                    }
                },
            )
            .build();

        let manager_windows = windows.clone();
        let window_managers = builder(config)
            .eviction_listener(
                move |key: Arc<StreamingKey>, manager: Arc<WindowManager>, cause: RemovalCause| {
                    if cause.was_evicted() {
                        info!(%key, ?cause, "evicted shared stream");
                        teardown_stream(&manager_windows, &key, &manager);
                    }
                },
            )
            .build();

        let executors = builder(config)
            .eviction_listener(
                |id: Arc<String>, _executor: Arc<QueryOrchestrator>, cause: RemovalCause| {
                    if cause.was_evicted() {
                        debug!(%id, ?cause, "evicted query");
                    }
                },
            )
            .build();

        ExecutorCache {
            executors,
            window_managers,
            windows,
        }
    }

    pub fn executor(&self, id: &str) -> Option<Arc<QueryOrchestrator>> {
        self.executors.get(id)
    }

    /// Register a query unless one with the same id exists. Returns the
    /// registered query.
    pub fn insert_executor_if_absent(
        &self,
        id: String,
        executor: Arc<QueryOrchestrator>,
    ) -> Arc<QueryOrchestrator> {
        self.executors.entry(id).or_insert_with(|| executor).into_value()
    }

    pub fn remove_executor(&self, id: &str) -> Option<Arc<QueryOrchestrator>> {
        self.executors.remove(id)
    }

    pub fn executor_ids(&self) -> Vec<String> {
        self.executors.iter().map(|(id, _)| (*id).clone()).collect()
    }

    pub fn window_manager(&self, key: &StreamingKey) -> Option<Arc<WindowManager>> {
        self.window_managers.get(key)
    }

    pub fn insert_window_manager_if_absent(
        &self,
        key: StreamingKey,
        manager: Arc<WindowManager>,
    ) -> Arc<WindowManager> {
        self.window_managers
            .entry(key)
            .or_insert_with(|| manager)
            .into_value()
    }

    /// Remove a shared stream, detaching its publishers and stopping its
    /// source.
    pub fn remove_window_manager(&self, key: &StreamingKey) -> Option<Arc<WindowManager>> {
        let manager = self.window_managers.remove(key)?;
        teardown_stream(&self.windows, key, &manager);
        Some(manager)
    }

    /// Remove the cached manager for `key` if its source graph has
    /// completed. A manager registered concurrently in its place is kept.
    pub fn remove_finished_window_manager(&self, key: &StreamingKey) -> Option<Arc<WindowManager>> {
        let manager = remove_if(&self.window_managers, key, |manager| {
            manager.source_graph().is_finished()
        })?;
        debug!(%key, "removing finished shared stream");
        teardown_stream(&self.windows, key, &manager);
        Some(manager)
    }

    pub fn window(&self, key: &WindowKey) -> Option<Arc<WindowPublisher>> {
        self.windows.get(key)
    }

    pub fn insert_window_if_absent(
        &self,
        key: WindowKey,
        publisher: Arc<WindowPublisher>,
    ) -> Arc<WindowPublisher> {
        self.windows.entry(key).or_insert_with(|| publisher).into_value()
    }

    pub fn remove_window(&self, key: &WindowKey) -> Option<Arc<WindowPublisher>> {
        let publisher = self.windows.remove(key)?;
        publisher.detach();
        Some(publisher)
    }

    /// Remove the publisher for `key` if it was detached.
    pub fn remove_detached_window(&self, key: &WindowKey) -> Option<Arc<WindowPublisher>> {
        remove_if(&self.windows, key, |publisher| publisher.is_detached())
    }

    pub fn executor_count(&self) -> usize {
        self.executors.run_pending_tasks();
        self.executors.entry_count() as usize
    }

    pub fn window_manager_count(&self) -> usize {
        self.window_managers.run_pending_tasks();
        self.window_managers.entry_count() as usize
    }

    pub fn window_count(&self) -> usize {
        self.windows.run_pending_tasks();
        self.windows.entry_count() as usize
    }

    /// Run pending maintenance, evicting idle entries and delivering their
    /// eviction notifications.
    pub fn run_pending_tasks(&self) {
        self.executors.run_pending_tasks();
        self.window_managers.run_pending_tasks();
        self.windows.run_pending_tasks();
    }
}

/// Remove the entry for `key` only if `stale` holds for its current value.
fn remove_if<K, V>(cache: &Cache<K, V>, key: &K, stale: impl FnOnce(&V) -> bool) -> Option<V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let result = cache.entry(key.clone()).and_compute_with(|entry| {
        let remove = entry.is_some_and(|entry| stale(entry.value()));
        if remove { Op::Remove } else { Op::Nop }
    });
    match result {
        CompResult::Removed(entry) => Some(entry.into_value()),
        _ => None,
    }
}

fn teardown_stream(
    windows: &Cache<WindowKey, Arc<WindowPublisher>>,
    key: &StreamingKey,
    manager: &WindowManager,
) {
    let keys: Vec<_> = windows
        .iter()
        .filter(|(window, _)| &window.stream == key)
        .map(|(window, _)| window)
        .collect();
    for window in keys {
        if let Some(publisher) = windows.remove(window.as_ref()) {
            publisher.detach();
        }
    }
    manager.shutdown();
}
