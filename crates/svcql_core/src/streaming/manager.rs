use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use svcql_error::{DbError, Result};
use tracing::{debug, info};
use uuid::Uuid;

use super::key::StreamingKey;
use super::publisher::WindowPublisher;
use super::window::WindowConfig;
use crate::cache::{ExecutorCache, WindowKey};
use crate::config::QueryLimits;
use crate::graph::ExecutionGraph;

/// Publishers attached to a stream. Closed once the source graph completes.
#[derive(Debug, Default)]
struct AttachedWindows {
    closed: bool,
    publishers: Vec<Weak<WindowPublisher>>,
}

/// Owns a running source graph shared by every streaming query with the
/// same [`StreamingKey`].
///
/// When the source graph completes every attached publisher is detached,
/// ending the subscriptions still waiting for a window.
#[derive(Debug)]
pub struct WindowManager {
    key: StreamingKey,
    source: Arc<dyn ExecutionGraph>,
    source_step: String,
    limits: QueryLimits,
    started: AtomicBool,
    attached: Arc<Mutex<AttachedWindows>>,
}

impl WindowManager {
    pub fn new(
        key: StreamingKey,
        source: Arc<dyn ExecutionGraph>,
        source_step: &str,
        limits: QueryLimits,
    ) -> Self {
        WindowManager {
            key,
            source,
            source_step: source_step.to_string(),
            limits,
            started: AtomicBool::new(false),
            attached: Arc::new(Mutex::new(AttachedWindows::default())),
        }
    }

    pub fn key(&self) -> &StreamingKey {
        &self.key
    }

    pub fn source_graph(&self) -> &Arc<dyn ExecutionGraph> {
        &self.source
    }

    pub fn source_step(&self) -> &str {
        &self.source_step
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    /// True once the shared source graph completed, normally or not.
    pub fn is_finished(&self) -> bool {
        self.source.is_finished()
    }

    /// Prepare and start the source graph with the key's parameters. Only
    /// the first call does anything.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.source.set_parameters(&self.key.parameters);
        if self.source.run_id().is_empty() {
            self.source.set_run_id(Uuid::new_v4().to_string());
        }

        let attached = self.attached.clone();
        let key = self.key.clone();
        self.source.on_finished(Box::new(move || {
            let publishers = {
                let mut attached = attached.lock();
                attached.closed = true;
                std::mem::take(&mut attached.publishers)
            };
            debug!(%key, publishers = publishers.len(), "shared stream finished, detaching windows");
            for publisher in publishers.iter().filter_map(Weak::upgrade) {
                publisher.detach();
            }
        }));

        self.source.prepare()?;
        self.source.start()?;
        info!(key = %self.key, graph = %self.source.name(), "started shared stream");
        Ok(())
    }

    /// Stop the shared source graph.
    pub fn shutdown(&self) {
        debug!(key = %self.key, "shutting down shared stream");
        self.source.stop();
    }

    /// Get the publisher for `config`, attaching a new one if none is
    /// cached.
    pub fn publisher(
        &self,
        cache: &ExecutorCache,
        config: WindowConfig,
        handoff_timeout: Duration,
    ) -> Result<Arc<WindowPublisher>> {
        let key = WindowKey::new(self.key.clone(), config);
        if let Some(existing) = cache.window(&key) {
            if !existing.is_detached() {
                return Ok(existing);
            }
            cache.remove_detached_window(&key);
        }

        let created = WindowPublisher::attach(self, config, handoff_timeout)?;
        let winner = cache.insert_window_if_absent(key.clone(), created.clone());
        if !Arc::ptr_eq(&winner, &created) {
            created.detach();
            return Ok(winner);
        }

        let mut attached = self.attached.lock();
        if attached.closed {
            drop(attached);
            created.detach();
            cache.remove_detached_window(&key);
            return Err(DbError::new(format!("Shared stream {} has finished", self.key))
                .with_field("service", self.key.service.clone()));
        }
        attached.publishers.retain(|p| p.strong_count() > 0);
        attached.publishers.push(Arc::downgrade(&created));
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::queue::QueuePoll;
    use crate::graph::{LocalGraph, RowQueue};
    use crate::types::{DataType, Field, Parameters, RowSchema};

    fn manager() -> WindowManager {
        let graph = LocalGraph::builder("stream")
            .queue_source("numbers", RowSchema::new([Field::new("n", DataType::Integer)]), 8)
            .build()
            .unwrap()
            .into_shared();
        let mut params = Parameters::new();
        params.insert("region".to_string(), "EU".to_string());
        WindowManager::new(
            StreamingKey::new("numbers", &params, Vec::new()),
            graph,
            "numbers",
            QueryLimits {
                row_limit: 10,
                time_limit_ms: 0,
            },
        )
    }

    #[test]
    fn start_applies_key_parameters_once() {
        let manager = manager();
        manager.start().unwrap();
        manager.start().unwrap();
        let source = manager.source_graph();
        assert!(source.is_running());
        assert_eq!(Some("EU"), source.parameters().get("region").map(|s| s.as_str()));
        assert!(!source.run_id().is_empty());

        manager.shutdown();
        source.wait_until_finished().unwrap();
        assert!(source.is_finished());
    }

    #[test]
    fn publishers_shared_per_window() {
        let cache = ExecutorCache::default();
        let manager = manager();
        manager.start().unwrap();

        let a = manager
            .publisher(&cache, WindowConfig::rows(5), Duration::from_millis(10))
            .unwrap();
        let b = manager
            .publisher(&cache, WindowConfig::rows(5), Duration::from_millis(10))
            .unwrap();
        let c = manager
            .publisher(&cache, WindowConfig::rows(2), Duration::from_millis(10))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        a.detach();
        c.detach();
        manager.shutdown();
    }

    #[test]
    fn finished_source_detaches_publishers() {
        let cache = ExecutorCache::default();
        let manager = manager();
        manager.start().unwrap();
        let publisher = manager
            .publisher(&cache, WindowConfig::rows(5), Duration::from_millis(10))
            .unwrap();
        let waiting = Arc::new(RowQueue::new(8));
        publisher.subscribe(waiting.clone()).unwrap();

        manager.source_graph().row_producer("numbers").unwrap().finish();
        manager.source_graph().wait_until_finished().unwrap();

        assert!(manager.is_finished());
        assert!(publisher.is_detached());
        assert_eq!(0, publisher.subscriber_count());
        assert_eq!(QueuePoll::Finished, waiting.take_row_wait(Duration::from_secs(1)));

        manager
            .publisher(&cache, WindowConfig::rows(3), Duration::from_millis(10))
            .unwrap_err();
        let rejected = WindowKey::new(manager.key().clone(), WindowConfig::rows(3));
        assert!(cache.window(&rejected).is_none());
    }
}
