//! Cuts a shared stream into windows and hands them to subscribed queries.
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use svcql_error::{DbError, Result};
use tracing::{debug, trace, warn};

use super::manager::WindowManager;
use super::window::{ResolvedWindow, WindowConfig, WindowMode};
use crate::graph::{ExecutionGraph, ListenerId, RowProducer};
use crate::types::Row;

/// How often the ticker checks if the publisher was detached.
const TICK_GRANULARITY: Duration = Duration::from_millis(25);

struct PublisherState {
    buffer: VecDeque<(Instant, Row)>,
    since_emit: u64,
    last_emit: Instant,
    last_window: Option<Arc<Vec<Row>>>,
    subscribers: Vec<Arc<dyn RowProducer>>,
}

/// Publishes windows of a window manager's stream for one window config.
///
/// Each subscriber gets exactly one window: the last one emitted if there is
/// one, otherwise the next. The window's rows are written to the
/// subscriber's producer followed by end-of-stream.
pub struct WindowPublisher {
    service: String,
    config: WindowConfig,
    window: ResolvedWindow,
    source: Arc<dyn ExecutionGraph>,
    source_step: String,
    handoff_timeout: Duration,
    state: Mutex<PublisherState>,
    listener: Mutex<Option<ListenerId>>,
    detached: AtomicBool,
}

impl fmt::Debug for WindowPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowPublisher")
            .field("service", &self.service)
            .field("window", &self.window)
            .field("detached", &self.is_detached())
            .finish_non_exhaustive()
    }
}

impl WindowPublisher {
    /// Start listening to the manager's source step.
    pub fn attach(
        manager: &WindowManager,
        config: WindowConfig,
        handoff_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let window = config.resolve(&manager.limits());
        let publisher = Arc::new(WindowPublisher {
            service: manager.key().service.clone(),
            config,
            window,
            source: manager.source_graph().clone(),
            source_step: manager.source_step().to_string(),
            handoff_timeout,
            state: Mutex::new(PublisherState {
                buffer: VecDeque::new(),
                since_emit: 0,
                last_emit: Instant::now(),
                last_window: None,
                subscribers: Vec::new(),
            }),
            listener: Mutex::new(None),
            detached: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&publisher);
        let id = publisher.source.add_row_listener(
            &publisher.source_step,
            Arc::new(move |row: &Row| {
                if let Some(publisher) = weak.upgrade() {
                    publisher.push_row(row.clone());
                }
                Ok(())
            }),
        )?;
        *publisher.listener.lock() = Some(id);

        let tick = match window.mode {
            WindowMode::Time => Duration::from_millis(window.every),
            WindowMode::Row => window.time_limit,
        };
        if !tick.is_zero() {
            let weak = Arc::downgrade(&publisher);
            let spawned = thread::Builder::new()
                .name(format!("svcql_window_{}", publisher.service))
                .spawn(move || run_ticker(weak, tick));
            if let Err(e) = spawned {
                publisher.detach();
                return Err(DbError::with_source(
                    "Failed to spawn window ticker thread",
                    Box::new(e),
                ));
            }
        }

        debug!(service = %publisher.service, window = ?publisher.window, "attached window publisher");
        Ok(publisher)
    }

    pub fn config(&self) -> WindowConfig {
        self.config
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn last_window(&self) -> Option<Arc<Vec<Row>>> {
        self.state.lock().last_window.clone()
    }

    /// Deliver one window to `consumer`.
    ///
    /// If a window was already emitted it's delivered before returning.
    pub fn subscribe(&self, consumer: Arc<dyn RowProducer>) -> Result<()> {
        if self.is_detached() {
            return Err(DbError::new(format!(
                "Window publisher for '{}' is detached",
                self.service
            )));
        }
        let cached = {
            let mut state = self.state.lock();
            match &state.last_window {
                Some(window) => Some(window.clone()),
                None => {
                    state.subscribers.push(consumer.clone());
                    None
                }
            }
        };
        if let Some(window) = cached {
            self.deliver(consumer.as_ref(), &window);
        }
        Ok(())
    }

    /// Drop a subscription still waiting for a window. Returns false if
    /// `consumer` wasn't waiting.
    pub fn unsubscribe(&self, consumer: &Arc<dyn RowProducer>) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| !Arc::ptr_eq(s, consumer));
        before != state.subscribers.len()
    }

    /// Stop listening to the source and end every pending subscription.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.listener.lock().take() {
            self.source.remove_row_listener(&self.source_step, id);
        }
        let subscribers = std::mem::take(&mut self.state.lock().subscribers);
        for subscriber in &subscribers {
            subscriber.finish();
        }
        debug!(service = %self.service, pending = subscribers.len(), "detached window publisher");
    }

    fn push_row(&self, row: Row) {
        if self.is_detached() {
            return;
        }
        let now = Instant::now();
        let ready = {
            let mut state = self.state.lock();
            state.buffer.push_back((now, row));
            state.since_emit += 1;
            self.trim(&mut state, now);
            self.window.mode == WindowMode::Row
                && (state.since_emit >= self.window.every
                    || (!self.window.time_limit.is_zero()
                        && now.duration_since(state.last_emit) >= self.window.time_limit))
        };
        if ready {
            self.emit();
        }
    }

    fn trim(&self, state: &mut PublisherState, now: Instant) {
        match self.window.mode {
            WindowMode::Row => {
                while state.buffer.len() as u64 > self.window.size {
                    state.buffer.pop_front();
                }
            }
            WindowMode::Time => {
                let size = Duration::from_millis(self.window.size);
                while let Some((at, _)) = state.buffer.front() {
                    if now.duration_since(*at) <= size {
                        break;
                    }
                    state.buffer.pop_front();
                }
            }
        }
        if self.window.max_rows > 0 {
            while state.buffer.len() > self.window.max_rows {
                state.buffer.pop_front();
            }
        }
    }

    /// Cut a window from the buffer and deliver it to waiting subscribers.
    fn emit(&self) {
        let (window, subscribers) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            self.trim(&mut state, now);

            let skip = match self.window.limit {
                0 => 0,
                limit => state.buffer.len().saturating_sub(limit),
            };
            let rows: Vec<Row> = state
                .buffer
                .iter()
                .skip(skip)
                .map(|(_, row)| row.clone())
                .collect();
            let window = Arc::new(rows);

            state.last_window = Some(window.clone());
            state.since_emit = 0;
            state.last_emit = now;
            (window, std::mem::take(&mut state.subscribers))
        };

        trace!(service = %self.service, rows = window.len(), subscribers = subscribers.len(), "emitting window");
        for subscriber in subscribers {
            self.deliver(subscriber.as_ref(), &window);
        }
    }

    /// Only flush row windows on the time cap if rows arrived since the last
    /// one.
    fn tick(&self) {
        let due = {
            let state = self.state.lock();
            match self.window.mode {
                WindowMode::Time => true,
                WindowMode::Row => {
                    state.since_emit > 0
                        && state.last_emit.elapsed() >= self.window.time_limit
                }
            }
        };
        if due {
            self.emit();
        }
    }

    fn deliver(&self, consumer: &dyn RowProducer, window: &[Row]) {
        for row in window {
            loop {
                match consumer.put_row_wait(row.clone(), self.handoff_timeout) {
                    Ok(true) => break,
                    Ok(false) if self.is_detached() => {
                        consumer.finish();
                        return;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(service = %self.service, error = %e, "window subscriber stopped accepting rows");
                        return;
                    }
                }
            }
        }
        consumer.finish();
    }
}

fn run_ticker(publisher: Weak<WindowPublisher>, tick: Duration) {
    let mut next = Instant::now() + tick;
    loop {
        thread::sleep(TICK_GRANULARITY.min(tick));
        let publisher = match publisher.upgrade() {
            Some(publisher) => publisher,
            None => return,
        };
        if publisher.is_detached() {
            return;
        }
        if Instant::now() >= next {
            publisher.tick();
            next = Instant::now() + tick;
        }
    }
}
