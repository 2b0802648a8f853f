//! AUTOMATE task graph.
//!
//! A directed acyclic dependency structure over tasks: batch admission with
//! cycle checking, per-task atomic lifecycle transitions, event-driven
//! readiness propagation, and cascading cancellation on rejection.

#![warn(missing_docs)]

mod admission;
mod store;

pub use admission::TaskSpec;
pub use store::{GraphError, GraphSnapshot, GraphStore};
