//! Query orchestration: wiring a source graph to a generated graph and
//! running the query lifecycle.
pub mod bridge;
pub mod orchestrator;
pub mod phase;
pub mod signal;

pub use bridge::RowBridge;
pub use orchestrator::{OrchestratorBuilder, QueryOrchestrator};
pub use phase::{ExecutionPoint, ListenerMap, PhaseReport, TaskId, TaskOutcome};
pub use signal::StartupSignal;
