//! The orchestrator façade - wires graph, gate, ledger and registry and
//! exposes the ingestion, approval, control, query and admin surfaces.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use automate_core::{
    Actor, ApprovalMode, ApproverRole, AuditEvent, AuditLog, Decision, OrgId, Task, TaskId,
    TaskState,
};
use automate_approval::{
    ApprovalError, ApprovalGate, ApprovalRequest, GateOutcome, OrgApprovalPolicy, PolicyError,
};
use automate_graph::{GraphError, GraphSnapshot, GraphStore, TaskSpec};
use automate_ledger::{BudgetLedger, BudgetUsage, OrgBudget};

use crate::registry::ExecutorRegistry;
use crate::scheduler::{PassStats, Scheduler, SchedulerConfig};

/// Errors surfaced by the orchestrator's external interfaces.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Graph admission or transition error
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Approval gate error
    #[error(transparent)]
    Approval(#[from] ApprovalError),

    /// Policy classification error
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A decision arrived for a task that is not waiting on one
    #[error("task {0} is not awaiting approval")]
    NotAwaitingApproval(TaskId),
}

/// The execution-and-governance core, assembled.
///
/// An upstream producer submits tasks; humans answer approval requests;
/// the scheduler dispatches under the ledger's guardrails; the Calendar/UI
/// collaborator reads everything back through the query surface.
pub struct Orchestrator {
    audit: Arc<AuditLog>,
    graph: Arc<GraphStore>,
    gate: Arc<ApprovalGate>,
    ledger: Arc<BudgetLedger>,
    scheduler: Arc<Scheduler>,
}

impl Orchestrator {
    /// Assemble with the default scheduler configuration.
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self::with_config(registry, SchedulerConfig::default())
    }

    /// Assemble with an explicit scheduler configuration.
    pub fn with_config(registry: ExecutorRegistry, config: SchedulerConfig) -> Self {
        let audit = Arc::new(AuditLog::new());
        let graph = Arc::new(GraphStore::new(audit.clone()));
        let gate = Arc::new(ApprovalGate::new(audit.clone()));
        let ledger = Arc::new(BudgetLedger::new());
        let scheduler = Arc::new(Scheduler::new(
            graph.clone(),
            gate.clone(),
            ledger.clone(),
            Arc::new(registry),
            audit.clone(),
            config,
        ));
        Self {
            audit,
            graph,
            gate,
            ledger,
            scheduler,
        }
    }

    // === Admin API ===

    /// Configure an org's budget and approval policy.
    pub fn configure_org(&self, org: OrgId, budget: OrgBudget, policy: OrgApprovalPolicy) {
        self.ledger.configure_org(org.clone(), budget, Utc::now());
        self.gate.set_org_policy(org, policy);
    }

    // === Ingestion API ===

    /// Submit a batch of tasks. The batch is admitted atomically: a cycle
    /// or unknown dependency rejects the whole batch. Each admitted task is
    /// classified, its approval request opened if needed, and evaluated.
    pub fn submit(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>, OrchestratorError> {
        let modes: Vec<ApprovalMode> = specs
            .iter()
            .map(|spec| {
                let classification = automate_core::Classification {
                    externality: spec.externality,
                    risk_tier: spec.risk_tier,
                    cost_class: spec.cost_class,
                    compliance_required: spec.compliance_required,
                };
                self.gate.classify(&spec.org, &classification)
            })
            .collect::<Result<_, _>>()?;

        let orgs: Vec<OrgId> = specs.iter().map(|s| s.org.clone()).collect();
        let ids = self.graph.submit(specs)?;
        for ((id, mode), org) in ids.iter().zip(modes).zip(orgs) {
            self.graph.set_approval_mode(*id, mode.clone())?;
            self.gate.open(*id, org, mode);
            self.graph.activate(*id)?;
        }
        info!(count = ids.len(), "batch submitted");
        Ok(ids)
    }

    // === Approval API ===

    /// Open requests the given role may currently decide on.
    pub fn pending_approvals(&self, role: ApproverRole) -> Vec<ApprovalRequest> {
        self.gate
            .pending_for(role)
            .into_iter()
            .filter(|request| {
                self.graph
                    .get(request.task_id)
                    .map(|t| t.state == TaskState::AwaitingApproval)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Record an approve/reject decision. A resolved request transitions
    /// the task; a rejection cascades cancellation to its dependents.
    pub fn decide(
        &self,
        task_id: TaskId,
        role: ApproverRole,
        actor: &str,
        decision: Decision,
        reason: Option<String>,
    ) -> Result<GateOutcome, OrchestratorError> {
        let task = self.graph.get(task_id)?;
        if task.state != TaskState::AwaitingApproval {
            return Err(OrchestratorError::NotAwaitingApproval(task_id));
        }

        let outcome = self.gate.decide(task_id, role, actor, decision, reason.clone())?;
        match outcome {
            GateOutcome::Approved => {
                self.graph
                    .mark_approved(task_id, Actor::role(role), "approval granted")?;
            }
            GateOutcome::Rejected => {
                let reason = reason.unwrap_or_else(|| "approval rejected".to_string());
                let cancelled = self.graph.mark_rejected(task_id, Actor::role(role), reason)?;
                for id in cancelled {
                    self.gate.discard(id);
                    self.scheduler.cancel_signal(id);
                }
            }
            GateOutcome::Pending => {}
        }
        Ok(outcome)
    }

    // === Control API ===

    /// Cancel a task. Cooperative: a running executor is signalled and
    /// stops at its next safe checkpoint; no further budget is reserved.
    /// Returns every task cancelled, cascaded dependents included.
    pub fn cancel(
        &self,
        task_id: TaskId,
        actor: Actor,
        reason: impl Into<String>,
    ) -> Result<Vec<TaskId>, OrchestratorError> {
        let cancelled = self.graph.cancel(task_id, actor, reason)?;
        for id in &cancelled {
            self.gate.discard(*id);
            self.scheduler.cancel_signal(*id);
        }
        Ok(cancelled)
    }

    /// Manually re-queue a `FailedPermanent` task, resetting its attempts.
    pub fn retry(&self, task_id: TaskId, actor: Actor) -> Result<TaskState, OrchestratorError> {
        Ok(self.graph.requeue(task_id, actor)?)
    }

    // === Query API ===

    /// Current state of one task.
    pub fn task(&self, task_id: TaskId) -> Result<Task, OrchestratorError> {
        Ok(self.graph.get(task_id)?)
    }

    /// Full ordered audit history for one task.
    pub fn history(&self, task_id: TaskId) -> Vec<AuditEvent> {
        self.audit.history(task_id)
    }

    /// Point-in-time snapshot of the whole graph.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    /// Budget usage for one org.
    pub fn usage(&self, org: &OrgId) -> Option<BudgetUsage> {
        self.ledger.usage(org, Utc::now())
    }

    // === Drive ===

    /// Run one scheduling pass.
    pub async fn run_pass(&self) -> PassStats {
        self.scheduler.run_pass().await
    }

    /// Await all in-flight executor runs.
    pub async fn drain(&self) {
        self.scheduler.drain().await
    }

    /// Run passes until nothing can make progress without outside input:
    /// no dispatchable work, nothing in flight, and no pending backoff.
    /// Tasks awaiting approval or starved by budget stay queued.
    pub async fn run_until_idle(&self) {
        loop {
            let stats = self.run_pass().await;
            self.drain().await;

            if stats.promoted > 0 || stats.dispatched > 0 || stats.expired > 0 {
                continue;
            }
            match self.graph.earliest_retry() {
                Some(retry_at) => {
                    let now = Utc::now();
                    let wait = (retry_at - now)
                        .to_std()
                        .unwrap_or(self.scheduler.config().pass_interval);
                    tokio::time::sleep(wait.min(self.scheduler.config().pass_interval)).await;
                }
                None => break,
            }
        }
    }

    /// Run the dispatch loop forever, sleeping between passes.
    pub async fn run(&self) {
        loop {
            self.run_pass().await;
            tokio::time::sleep(self.scheduler.config().pass_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use automate_core::{CostClass, Domain, Externality, RiskTier};
    use automate_ledger::{
        BudgetPeriod, DegradationThresholds, Watermark,
    };

    use crate::registry::{DomainExecutor, ExecutionReport, ExecutionRequest};

    fn test_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_backoff_base(Duration::from_millis(1))
            .with_pass_interval(Duration::from_millis(1))
            .with_task_timeout(Some(Duration::from_secs(5)))
    }

    fn org() -> OrgId {
        OrgId::new("acme")
    }

    fn wide_open_budget() -> OrgBudget {
        OrgBudget::new(1_000_000.0, BudgetPeriod::Monthly).with_default_cap(16)
    }

    /// Policy table where nothing needs sign-off, for tests that exercise
    /// the ledger rather than the gate.
    fn no_approval_policy() -> OrgApprovalPolicy {
        let mut table = automate_approval::PolicyTable::new(Vec::new());
        for externality in automate_approval::EXTERNALITIES {
            for risk_tier in automate_approval::RISK_TIERS {
                for cost_class in automate_approval::COST_CLASSES {
                    table.set(externality, risk_tier, cost_class, ApprovalMode::None);
                }
            }
        }
        OrgApprovalPolicy {
            table,
            approval_expiry: None,
        }
    }

    /// Executor that always succeeds at a fixed cost.
    struct FixedCostExecutor {
        domain: Domain,
        cost: f64,
    }

    #[async_trait]
    impl DomainExecutor for FixedCostExecutor {
        fn domain(&self) -> Domain {
            self.domain
        }

        async fn run(&self, _request: ExecutionRequest) -> ExecutionReport {
            ExecutionReport::success(self.cost)
        }
    }

    /// Executor that fails transiently a configured number of times, then
    /// succeeds.
    struct FlakyExecutor {
        domain: Domain,
        failures: AtomicU32,
    }

    #[async_trait]
    impl DomainExecutor for FlakyExecutor {
        fn domain(&self) -> Domain {
            self.domain
        }

        async fn run(&self, _request: ExecutionRequest) -> ExecutionReport {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok() {
                // Failed attempts still burned a little spend.
                ExecutionReport::transient("rate limited").with_cost(0.1)
            } else {
                ExecutionReport::success(1.0)
            }
        }
    }

    /// Executor that records the order tasks reach it.
    struct RecordingExecutor {
        domain: Domain,
        seen: Arc<Mutex<Vec<TaskId>>>,
    }

    #[async_trait]
    impl DomainExecutor for RecordingExecutor {
        fn domain(&self) -> Domain {
            self.domain
        }

        async fn run(&self, request: ExecutionRequest) -> ExecutionReport {
            self.seen.lock().unwrap().push(request.task_id);
            ExecutionReport::success(1.0)
        }
    }

    /// Executor that parks until cancelled, then reports partial cost.
    struct ParkedExecutor {
        domain: Domain,
    }

    #[async_trait]
    impl DomainExecutor for ParkedExecutor {
        fn domain(&self) -> Domain {
            self.domain
        }

        async fn run(&self, request: ExecutionRequest) -> ExecutionReport {
            request.cancel.cancelled().await;
            ExecutionReport::success(5.0).with_detail("stopped at checkpoint")
        }
    }

    fn orchestrator_with(executor: Arc<dyn DomainExecutor>) -> Orchestrator {
        let mut registry = ExecutorRegistry::new();
        registry.register(executor);
        let orchestrator = Orchestrator::with_config(registry, test_config());
        orchestrator.configure_org(org(), wide_open_budget(), OrgApprovalPolicy::default());
        orchestrator
    }

    fn internal_task() -> TaskSpec {
        TaskSpec::new(org(), Domain::Content)
    }

    async fn wait_for_state(orchestrator: &Orchestrator, id: TaskId, state: TaskState) {
        for _ in 0..1000 {
            if orchestrator.task(id).unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("task {id} never reached {state}");
    }

    #[tokio::test]
    async fn test_dependency_chain_completes_in_order() {
        let orchestrator =
            orchestrator_with(Arc::new(FixedCostExecutor { domain: Domain::Content, cost: 2.0 }));

        let first = internal_task();
        let first_id = first.id;
        let second = internal_task().with_depends_on(vec![first_id]);
        let second_id = second.id;
        orchestrator.submit(vec![first, second]).unwrap();

        orchestrator.run_until_idle().await;

        assert_eq!(orchestrator.task(first_id).unwrap().state, TaskState::Completed);
        assert_eq!(orchestrator.task(second_id).unwrap().state, TaskState::Completed);

        // The dependent only ever ran after its dependency completed: its
        // history shows it blocked first.
        let history = orchestrator.history(second_id);
        let blocked_seq = history
            .iter()
            .find(|e| e.to_state == TaskState::Blocked)
            .map(|e| e.seq)
            .unwrap();
        let running_seq = history
            .iter()
            .find(|e| e.to_state == TaskState::Running)
            .map(|e| e.seq)
            .unwrap();
        assert!(blocked_seq < running_seq);

        // Both reservations settled into spend.
        let usage = orchestrator.usage(&org()).unwrap();
        assert_eq!(usage.spent, 4.0);
        assert_eq!(usage.reserved, 0.0);
    }

    #[tokio::test]
    async fn test_chained_rejection_cascades_before_dependents_ever_run() {
        let orchestrator =
            orchestrator_with(Arc::new(FixedCostExecutor { domain: Domain::Pr, cost: 1.0 }));

        let risky = TaskSpec::new(org(), Domain::Pr)
            .with_externality(Externality::External)
            .with_risk(RiskTier::High);
        let risky_id = risky.id;
        let child = TaskSpec::new(org(), Domain::Pr).with_depends_on(vec![risky_id]);
        let child_id = child.id;
        let grandchild = TaskSpec::new(org(), Domain::Pr).with_depends_on(vec![child_id]);
        let grandchild_id = grandchild.id;
        orchestrator.submit(vec![risky, child, grandchild]).unwrap();

        // external+high classifies as a chained approval.
        let task = orchestrator.task(risky_id).unwrap();
        assert!(matches!(task.approval_mode, Some(ApprovalMode::Chained { .. })));
        assert_eq!(task.state, TaskState::AwaitingApproval);

        // First approver in the chain rejects; the rest are skipped.
        let outcome = orchestrator
            .decide(
                risky_id,
                ApproverRole::Requester,
                "bob",
                Decision::Reject,
                Some("too spicy".to_string()),
            )
            .unwrap();
        assert_eq!(outcome, GateOutcome::Rejected);

        orchestrator.run_until_idle().await;

        assert_eq!(orchestrator.task(risky_id).unwrap().state, TaskState::Rejected);
        for id in [child_id, grandchild_id] {
            assert_eq!(orchestrator.task(id).unwrap().state, TaskState::Cancelled);
            // Never Ready, never Running.
            let history = orchestrator.history(id);
            assert!(history.iter().all(|e| e.to_state != TaskState::Ready));
            assert!(history.iter().all(|e| e.to_state != TaskState::Running));
        }
    }

    #[tokio::test]
    async fn test_confirm_approval_unblocks_dispatch() {
        let orchestrator =
            orchestrator_with(Arc::new(FixedCostExecutor { domain: Domain::Content, cost: 1.0 }));

        let task = internal_task().with_risk(RiskTier::Medium);
        let id = task.id;
        orchestrator.submit(vec![task]).unwrap();

        orchestrator.run_until_idle().await;
        assert_eq!(orchestrator.task(id).unwrap().state, TaskState::AwaitingApproval);
        assert_eq!(orchestrator.pending_approvals(ApproverRole::DomainLead).len(), 1);

        orchestrator
            .decide(id, ApproverRole::DomainLead, "alice", Decision::Approve, None)
            .unwrap();
        orchestrator.run_until_idle().await;

        assert_eq!(orchestrator.task(id).unwrap().state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_compliance_required_forces_chain() {
        let orchestrator =
            orchestrator_with(Arc::new(FixedCostExecutor { domain: Domain::Content, cost: 1.0 }));

        let task = internal_task().with_compliance_required();
        let id = task.id;
        orchestrator.submit(vec![task]).unwrap();

        let task = orchestrator.task(id).unwrap();
        assert!(matches!(task.approval_mode, Some(ApprovalMode::Chained { .. })));
        assert_eq!(task.state, TaskState::AwaitingApproval);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let orchestrator = orchestrator_with(Arc::new(FlakyExecutor {
            domain: Domain::Content,
            failures: AtomicU32::new(2),
        }));

        let task = internal_task();
        let id = task.id;
        orchestrator.submit(vec![task]).unwrap();
        orchestrator.run_until_idle().await;

        let task = orchestrator.task(id).unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.attempts, 3);

        // The audit history tells the whole retry story.
        let history = orchestrator.history(id);
        let transient_count = history
            .iter()
            .filter(|e| e.to_state == TaskState::FailedTransient)
            .count();
        assert_eq!(transient_count, 2);
        assert!(history
            .iter()
            .any(|e| e.to_state == TaskState::Running && e.reason.contains("attempt 3")));
    }

    #[tokio::test]
    async fn test_attempts_exhausted_becomes_failed_permanent() {
        let orchestrator = orchestrator_with(Arc::new(FlakyExecutor {
            domain: Domain::Content,
            failures: AtomicU32::new(u32::MAX),
        }));

        let task = internal_task();
        let id = task.id;
        orchestrator.submit(vec![task]).unwrap();
        orchestrator.run_until_idle().await;

        let task = orchestrator.task(id).unwrap();
        assert_eq!(task.state, TaskState::FailedPermanent);
        assert_eq!(task.attempts, 5);

        // Manual retry resets the attempt budget and re-queues.
        let state = orchestrator.retry(id, Actor::user("ops")).unwrap();
        assert_eq!(state, TaskState::Approved);
        assert_eq!(orchestrator.task(id).unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_permanent_error_is_terminal_and_surfaced() {
        struct Doomed;

        #[async_trait]
        impl DomainExecutor for Doomed {
            fn domain(&self) -> Domain {
                Domain::Content
            }

            async fn run(&self, _request: ExecutionRequest) -> ExecutionReport {
                ExecutionReport::permanent("payload failed policy validation")
            }
        }

        let orchestrator = orchestrator_with(Arc::new(Doomed));
        let task = internal_task();
        let id = task.id;
        orchestrator.submit(vec![task]).unwrap();
        orchestrator.run_until_idle().await;

        assert_eq!(orchestrator.task(id).unwrap().state, TaskState::FailedPermanent);
        let history = orchestrator.history(id);
        assert!(history
            .iter()
            .any(|e| e.reason.contains("payload failed policy validation")));
    }

    #[tokio::test]
    async fn test_missing_executor_fails_permanently() {
        // Registry serves Content only; the task wants SEO.
        let orchestrator =
            orchestrator_with(Arc::new(FixedCostExecutor { domain: Domain::Content, cost: 1.0 }));
        let task = TaskSpec::new(org(), Domain::Seo);
        let id = task.id;
        orchestrator.submit(vec![task]).unwrap();
        orchestrator.run_until_idle().await;

        let task = orchestrator.task(id).unwrap();
        assert_eq!(task.state, TaskState::FailedPermanent);
        assert!(orchestrator
            .history(id)
            .iter()
            .any(|e| e.reason.contains("no executor registered")));
    }

    #[tokio::test]
    async fn test_budget_and_cap_guardrails_end_to_end() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(FixedCostExecutor { domain: Domain::Content, cost: 30.0 }));
        let orchestrator = Orchestrator::with_config(registry, test_config());
        orchestrator.configure_org(
            org(),
            OrgBudget::new(100.0, BudgetPeriod::Daily).with_default_cap(2),
            no_approval_policy(),
        );

        let specs: Vec<TaskSpec> = (0..5)
            .map(|_| internal_task().with_cost(CostClass::Api, 30.0))
            .collect();
        let ids = orchestrator.submit(specs).unwrap();
        orchestrator.run_until_idle().await;

        // 30 * 3 = 90 fits the allocation; a fourth would need 120.
        let states: Vec<TaskState> = ids
            .iter()
            .map(|id| orchestrator.task(*id).unwrap().state)
            .collect();
        let completed = states.iter().filter(|s| **s == TaskState::Completed).count();
        let queued = states.iter().filter(|s| **s == TaskState::Approved).count();
        assert_eq!(completed, 3);
        assert_eq!(queued, 2);

        let usage = orchestrator.usage(&org()).unwrap();
        assert_eq!(usage.spent, 90.0);
        assert_eq!(usage.reserved, 0.0);
        assert!(usage.spent + usage.reserved <= 100.0);
    }

    #[tokio::test]
    async fn test_priority_orders_dispatch_under_cap() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(RecordingExecutor {
            domain: Domain::Content,
            seen: seen.clone(),
        }));
        let orchestrator = Orchestrator::with_config(registry, test_config());
        orchestrator.configure_org(
            org(),
            wide_open_budget().with_default_cap(1),
            OrgApprovalPolicy::default(),
        );

        let low = internal_task().with_priority(10);
        let low_id = low.id;
        let high = internal_task().with_priority(200);
        let high_id = high.id;
        orchestrator.submit(vec![low, high]).unwrap();
        orchestrator.run_until_idle().await;

        let order = seen.lock().unwrap().clone();
        assert_eq!(order, vec![high_id, low_id]);
    }

    #[tokio::test]
    async fn test_cooperative_cancellation_of_running_task() {
        let orchestrator = orchestrator_with(Arc::new(ParkedExecutor { domain: Domain::Content }));
        orchestrator.configure_org(org(), wide_open_budget(), no_approval_policy());
        let task = internal_task().with_cost(CostClass::Llm, 20.0);
        let id = task.id;
        orchestrator.submit(vec![task]).unwrap();

        orchestrator.run_pass().await;
        wait_for_state(&orchestrator, id, TaskState::Running).await;

        orchestrator.cancel(id, Actor::user("ops"), "campaign pulled").unwrap();
        orchestrator.drain().await;

        // Cancellation wins; the executor's late success is dropped, but
        // the partial cost it reported is reconciled.
        let task = orchestrator.task(id).unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        let usage = orchestrator.usage(&org()).unwrap();
        assert_eq!(usage.spent, 5.0);
        assert_eq!(usage.reserved, 0.0);
        assert!(orchestrator
            .history(id)
            .iter()
            .all(|e| e.to_state != TaskState::Completed));
    }

    #[tokio::test]
    async fn test_queue_only_degradation_stops_dispatch() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(FixedCostExecutor { domain: Domain::Content, cost: 60.0 }));
        let orchestrator = Orchestrator::with_config(registry, test_config());
        orchestrator.configure_org(
            org(),
            OrgBudget::new(100.0, BudgetPeriod::Daily)
                .with_default_cap(4)
                .with_thresholds(DegradationThresholds {
                    cheaper_model: Watermark { high: 0.2, low: 0.1 },
                    reduced_frequency: Watermark { high: 0.4, low: 0.2 },
                    queue_only: Watermark { high: 0.5, low: 0.3 },
                }),
            no_approval_policy(),
        );

        let first = internal_task().with_cost(CostClass::Api, 60.0);
        let first_id = first.id;
        orchestrator.submit(vec![first]).unwrap();
        orchestrator.run_until_idle().await;
        assert_eq!(orchestrator.task(first_id).unwrap().state, TaskState::Completed);

        // Spend ratio is now 0.6, past the queue-only watermark.
        let second = internal_task().with_cost(CostClass::Api, 10.0);
        let second_id = second.id;
        orchestrator.submit(vec![second]).unwrap();
        orchestrator.run_until_idle().await;

        assert_eq!(orchestrator.task(second_id).unwrap().state, TaskState::Approved);
        let usage = orchestrator.usage(&org()).unwrap();
        assert_eq!(usage.level, automate_ledger::DegradationLevel::QueueOnly);
    }

    #[tokio::test]
    async fn test_overage_lands_in_the_audit_trail() {
        let orchestrator =
            orchestrator_with(Arc::new(FixedCostExecutor { domain: Domain::Content, cost: 50.0 }));
        orchestrator.configure_org(org(), wide_open_budget(), no_approval_policy());
        let task = internal_task().with_cost(CostClass::Llm, 10.0);
        let id = task.id;
        orchestrator.submit(vec![task]).unwrap();
        orchestrator.run_until_idle().await;

        assert_eq!(orchestrator.task(id).unwrap().state, TaskState::Completed);
        assert!(orchestrator
            .history(id)
            .iter()
            .any(|e| e.reason.contains("ledger warning")));
    }

    #[tokio::test]
    async fn test_cycle_and_unknown_dependency_reject_whole_batch() {
        let orchestrator =
            orchestrator_with(Arc::new(FixedCostExecutor { domain: Domain::Content, cost: 1.0 }));

        let mut a = internal_task();
        let b = internal_task().with_depends_on(vec![a.id]);
        a.depends_on = vec![b.id];
        let err = orchestrator.submit(vec![a, b]).unwrap_err();
        assert!(matches!(err, OrchestratorError::Graph(GraphError::Cycle { .. })));

        let orphan = internal_task().with_depends_on(vec![TaskId::new()]);
        let err = orchestrator.submit(vec![orphan]).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Graph(GraphError::UnknownDependency { .. })
        ));

        // Nothing was admitted.
        assert!(orchestrator.snapshot().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_approval_expiry_auto_cancels() {
        let orchestrator =
            orchestrator_with(Arc::new(FixedCostExecutor { domain: Domain::Content, cost: 1.0 }));
        orchestrator.configure_org(
            org(),
            wide_open_budget(),
            OrgApprovalPolicy {
                approval_expiry: Some(Duration::ZERO),
                ..OrgApprovalPolicy::default()
            },
        );

        let task = internal_task().with_risk(RiskTier::Medium);
        let id = task.id;
        orchestrator.submit(vec![task]).unwrap();

        // First pass starts the clock, second pass reaps the expired
        // request and cancels the task.
        orchestrator.run_pass().await;
        orchestrator.run_pass().await;
        orchestrator.drain().await;

        assert_eq!(orchestrator.task(id).unwrap().state, TaskState::Cancelled);
        assert!(orchestrator
            .history(id)
            .iter()
            .any(|e| e.reason.contains("approval expired")));
    }
}
