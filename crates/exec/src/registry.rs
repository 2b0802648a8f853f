//! Executor registry - the capability contract for domain agents.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use automate_core::{Domain, OrgId, TaskId};
use automate_ledger::DegradationLevel;

/// Everything an executor needs to perform one attempt of a task.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The task being executed
    pub task_id: TaskId,
    /// Owning organization
    pub org: OrgId,
    /// Owning domain
    pub domain: Domain,
    /// Opaque payload, interpreted only by the executor
    pub payload: serde_json::Value,
    /// Which attempt this is (1-based)
    pub attempt: u32,
    /// Degradation hint the executor should honor (e.g. cheaper model)
    pub degradation: DegradationLevel,
    /// Cooperative cancellation signal; stop at the next safe checkpoint
    pub cancel: CancellationToken,
}

/// How an execution attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The work was done
    Success,
    /// Retryable failure (network, rate limit)
    TransientError,
    /// Non-retryable failure (invalid input, policy violation)
    PermanentError,
}

/// What an executor reports back to the scheduler.
///
/// Executors are the only components that report actual cost; the core
/// never estimates beyond the reservation amount.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// How the attempt ended
    pub outcome: ExecutionOutcome,
    /// Actual monetary/compute cost incurred, even on failure
    pub actual_cost: f64,
    /// References to produced artifacts
    pub artifacts: Vec<String>,
    /// Human-readable detail, surfaced in the audit trail
    pub detail: String,
}

impl ExecutionReport {
    /// A successful attempt with the given actual cost.
    pub fn success(actual_cost: f64) -> Self {
        Self {
            outcome: ExecutionOutcome::Success,
            actual_cost,
            artifacts: Vec::new(),
            detail: String::new(),
        }
    }

    /// A retryable failure.
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::TransientError,
            actual_cost: 0.0,
            artifacts: Vec::new(),
            detail: detail.into(),
        }
    }

    /// A non-retryable failure.
    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::PermanentError,
            actual_cost: 0.0,
            artifacts: Vec::new(),
            detail: detail.into(),
        }
    }

    /// Attach an artifact reference.
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifacts.push(artifact.into());
        self
    }

    /// Attach detail text.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Set the actual cost on a failure report.
    pub fn with_cost(mut self, actual_cost: f64) -> Self {
        self.actual_cost = actual_cost;
        self
    }
}

/// A domain agent that actually performs work.
///
/// The scheduler treats all executors uniformly through this contract and
/// has no knowledge of domain-specific logic.
#[async_trait]
pub trait DomainExecutor: Send + Sync {
    /// The domain this executor serves.
    fn domain(&self) -> Domain;

    /// Perform one attempt and report outcome and actual cost.
    async fn run(&self, request: ExecutionRequest) -> ExecutionReport;
}

/// Lookup table from domain to its registered executor.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<Domain, Arc<dyn DomainExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its domain. Replaces any previous one.
    pub fn register(&mut self, executor: Arc<dyn DomainExecutor>) {
        self.executors.insert(executor.domain(), executor);
    }

    /// Look up the executor for a domain.
    pub fn get(&self, domain: Domain) -> Option<Arc<dyn DomainExecutor>> {
        self.executors.get(&domain).cloned()
    }

    /// All registered domains.
    pub fn domains(&self) -> Vec<Domain> {
        self.executors.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopExecutor(Domain);

    #[async_trait]
    impl DomainExecutor for NoopExecutor {
        fn domain(&self) -> Domain {
            self.0
        }

        async fn run(&self, _request: ExecutionRequest) -> ExecutionReport {
            ExecutionReport::success(0.0)
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NoopExecutor(Domain::Pr)));
        registry.register(Arc::new(NoopExecutor(Domain::Content)));

        assert!(registry.get(Domain::Pr).is_some());
        assert!(registry.get(Domain::Seo).is_none());
        assert_eq!(registry.domains().len(), 2);
    }
}
