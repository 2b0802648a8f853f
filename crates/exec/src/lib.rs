//! AUTOMATE execution layer.
//!
//! The executor registry contract, the scheduler/dispatch loop with budget
//! and degradation guardrails, and the orchestrator façade that exposes
//! the ingestion, approval, control, query and admin surfaces.

#![warn(missing_docs)]

mod orchestrator;
mod registry;
mod scheduler;

pub use orchestrator::{Orchestrator, OrchestratorError};
pub use registry::{
    DomainExecutor, ExecutionOutcome, ExecutionReport, ExecutionRequest, ExecutorRegistry,
};
pub use scheduler::{PassStats, Scheduler, SchedulerConfig};
