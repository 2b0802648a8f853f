//! AUTOMATE core data models.
//!
//! This crate defines the fundamental data structures of the
//! execution-and-governance layer: identifiers, the task model and its
//! lifecycle state machine, the approval vocabulary, and the append-only
//! audit log.

#![warn(missing_docs)]

// Core identities
mod id;

// Task lifecycle
mod task;

// Approval vocabulary
mod approval;

// Audit stream
mod audit;

// Re-exports
pub use id::{OrgId, ReservationId, TaskId};

pub use task::{
    Classification, CostClass, Domain, Externality, RiskTier, Task, TaskState,
};

pub use approval::{ApprovalDecision, ApprovalMode, ApproverRole, Decision};

pub use audit::{Actor, AuditEvent, AuditLog};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
