//! Lifecycle phases of a query and the tasks registered against them.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use svcql_error::Result;
use tracing::{error, trace};

/// Phases a query passes through, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionPoint {
    Prepare,
    Optimize,
    Ready,
    Start,
}

impl ExecutionPoint {
    pub const ALL: [ExecutionPoint; 4] = [
        ExecutionPoint::Prepare,
        ExecutionPoint::Optimize,
        ExecutionPoint::Ready,
        ExecutionPoint::Start,
    ];
}

impl fmt::Display for ExecutionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionPoint::Prepare => "PREPARE",
            ExecutionPoint::Optimize => "OPTIMIZE",
            ExecutionPoint::Ready => "READY",
            ExecutionPoint::Start => "START",
        };
        write!(f, "{s}")
    }
}

/// What to do with a task after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Keep,
    /// Deregister the task.
    Remove,
}

pub type TaskId = u64;

type PhaseTask = Box<dyn FnMut() -> Result<TaskOutcome> + Send>;

struct TaskEntry {
    id: TaskId,
    task: Arc<Mutex<PhaseTask>>,
}

/// Result of running a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub ran: usize,
    pub removed: usize,
    /// The task list changed in a way other than tasks removing themselves.
    pub diverged: bool,
}

/// Ordered task lists per phase.
///
/// Tasks run in registration order. A task may deregister itself by
/// returning [`TaskOutcome::Remove`]. Tasks must not change the list of the
/// phase that's running, doing so is logged but doesn't abort the phase.
#[derive(Default)]
pub struct ListenerMap {
    next_id: AtomicU64,
    phases: Mutex<BTreeMap<ExecutionPoint, Vec<TaskEntry>>>,
}

impl fmt::Debug for ListenerMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<ExecutionPoint, usize> = self
            .phases
            .lock()
            .iter()
            .map(|(point, tasks)| (*point, tasks.len()))
            .collect();
        f.debug_struct("ListenerMap").field("tasks", &counts).finish()
    }
}

impl ListenerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        point: ExecutionPoint,
        task: impl FnMut() -> Result<TaskOutcome> + Send + 'static,
    ) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.phases.lock().entry(point).or_default().push(TaskEntry {
            id,
            task: Arc::new(Mutex::new(Box::new(task))),
        });
        id
    }

    pub fn remove(&self, point: ExecutionPoint, id: TaskId) -> bool {
        let mut phases = self.phases.lock();
        match phases.get_mut(&point) {
            Some(tasks) => {
                let before = tasks.len();
                tasks.retain(|t| t.id != id);
                tasks.len() != before
            }
            None => false,
        }
    }

    pub fn len(&self, point: ExecutionPoint) -> usize {
        self.phases.lock().get(&point).map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, point: ExecutionPoint) -> bool {
        self.len(point) == 0
    }

    fn task_ids(&self, point: ExecutionPoint) -> Vec<TaskId> {
        self.phases
            .lock()
            .get(&point)
            .map(|tasks| tasks.iter().map(|t| t.id).collect())
            .unwrap_or_default()
    }

    /// Run every task registered for the phase.
    ///
    /// The task list is snapshotted before running. Afterwards the live list
    /// is compared against the snapshot minus self-removed tasks and any
    /// difference is logged. A failing task stops the phase.
    pub fn run(&self, point: ExecutionPoint) -> Result<PhaseReport> {
        let snapshot: Vec<(TaskId, Arc<Mutex<PhaseTask>>)> = self
            .phases
            .lock()
            .get(&point)
            .map(|tasks| tasks.iter().map(|t| (t.id, t.task.clone())).collect())
            .unwrap_or_default();

        let mut report = PhaseReport::default();
        let mut removed = Vec::new();
        for (id, task) in &snapshot {
            trace!(phase = %point, task = id, "running phase task");
            let outcome = {
                let mut guard = task.lock();
                let task: &mut PhaseTask = &mut guard;
                task()?
            };
            report.ran += 1;
            if outcome == TaskOutcome::Remove {
                self.remove(point, *id);
                removed.push(*id);
            }
        }
        report.removed = removed.len();

        let expected: Vec<TaskId> = snapshot
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !removed.contains(id))
            .collect();
        let live = self.task_ids(point);
        if expected != live {
            error!(
                phase = %point,
                ?expected,
                ?live,
                "listener list changed while the phase was executing"
            );
            report.diverged = true;
        }

        Ok(report)
    }
}
