//! The dispatch loop - selects ready, approved, budget-clear tasks and
//! hands them to executors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use automate_core::{Actor, AuditLog, OrgId, Task, TaskId, TaskState, Time};
use automate_graph::GraphStore;
use automate_approval::ApprovalGate;
use automate_ledger::{BudgetLedger, DegradationLevel, LedgerError, Reservation};

use crate::registry::{ExecutionOutcome, ExecutionReport, ExecutionRequest, ExecutorRegistry};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total execution attempts allowed before a task fails permanently
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff
    pub backoff_base: Duration,
    /// Ceiling on the computed backoff delay
    pub backoff_cap: Duration,
    /// Max runtime per attempt; overruns count as transient failures
    pub task_timeout: Option<Duration>,
    /// Sleep between passes when the loop has nothing to dispatch
    pub pass_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(3600),
            task_timeout: Some(Duration::from_secs(300)),
            pass_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    /// Set the attempt bound.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff base delay.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the idle pass interval.
    pub fn with_pass_interval(mut self, interval: Duration) -> Self {
        self.pass_interval = interval;
        self
    }
}

/// Backoff before attempt `attempt + 1`: `base * 2^(attempt-1)`, capped.
pub(crate) fn backoff_delay(config: &SchedulerConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let factor = 2u32.saturating_pow(exponent);
    config.backoff_base.saturating_mul(factor).min(config.backoff_cap)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// What one scheduling pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassStats {
    /// Tasks promoted out of `Pending`/`Blocked`
    pub promoted: usize,
    /// Tasks handed to executors
    pub dispatched: usize,
    /// Tasks left queued by budget, cap or degradation
    pub deferred: usize,
    /// Approval requests that expired and auto-cancelled their task
    pub expired: usize,
}

/// The dispatch loop.
///
/// Every pass: sweep approval expiry, promote due tasks, collect `Approved`
/// candidates grouped by org, order them by priority (descending) then
/// creation time (FIFO tie-break), and dispatch each one that clears the
/// budget ledger. Executor runs are spawned; settlement happens when they
/// report back.
pub struct Scheduler {
    graph: Arc<GraphStore>,
    gate: Arc<ApprovalGate>,
    ledger: Arc<BudgetLedger>,
    registry: Arc<ExecutorRegistry>,
    audit: Arc<AuditLog>,
    config: SchedulerConfig,
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Wire a scheduler over the shared component set.
    pub fn new(
        graph: Arc<GraphStore>,
        gate: Arc<ApprovalGate>,
        ledger: Arc<BudgetLedger>,
        registry: Arc<ExecutorRegistry>,
        audit: Arc<AuditLog>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            graph,
            gate,
            ledger,
            registry,
            audit,
            config,
            tokens: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one scheduling pass.
    pub async fn run_pass(self: &Arc<Self>) -> PassStats {
        let now = Utc::now();
        let mut stats = PassStats::default();

        self.sweep_approvals(now, &mut stats);
        stats.promoted = self.graph.promote_due(now);

        let mut by_org: HashMap<OrgId, Vec<Task>> = HashMap::new();
        for task in self.graph.approved_candidates() {
            by_org.entry(task.org.clone()).or_default().push(task);
        }

        for (org, mut candidates) in by_org {
            candidates.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            });

            let level = self.ledger.degradation(&org, now);
            if level == DegradationLevel::QueueOnly {
                debug!(org = %org, "queue-only degradation, deferring dispatch");
                stats.deferred += candidates.len();
                continue;
            }

            let mut dispatched_for_org = 0usize;
            for task in candidates {
                if level == DegradationLevel::ReducedFrequency && dispatched_for_org >= 1 {
                    stats.deferred += 1;
                    continue;
                }
                match self.ledger.reserve(&org, task.domain, task.id, task.estimated_cost, now) {
                    Ok(reservation) => {
                        if let Err(err) = self.graph.mark_dispatched(task.id) {
                            // The task slipped away (cancelled) between
                            // candidate collection and dispatch.
                            debug!(task = %task.id, %err, "dispatch dropped");
                            if let Err(err) = self.ledger.release(&reservation, now) {
                                warn!(task = %task.id, %err, "failed to release reservation");
                            }
                            continue;
                        }
                        self.spawn_execution(task, reservation, level);
                        dispatched_for_org += 1;
                        stats.dispatched += 1;
                    }
                    Err(
                        err @ (LedgerError::BudgetExceeded { .. }
                        | LedgerError::ConcurrencyCapReached { .. }),
                    ) => {
                        // Not an execution failure: the task stays Approved
                        // and is retried on the next pass.
                        debug!(org = %org, task = %task.id, %err, "dispatch deferred");
                        stats.deferred += 1;
                    }
                    Err(err) => {
                        warn!(org = %org, task = %task.id, %err, "dispatch admission failed");
                        stats.deferred += 1;
                    }
                }
            }
        }

        stats
    }

    /// Start expiry clocks for tasks now waiting, and auto-cancel requests
    /// whose org-configured expiry has elapsed.
    fn sweep_approvals(&self, now: Time, stats: &mut PassStats) {
        for id in self.gate.unclocked() {
            if let Ok(task) = self.graph.get(id) {
                if task.state == TaskState::AwaitingApproval {
                    self.gate.start_clock(id, now);
                }
            }
        }
        for id in self.gate.expired(now) {
            match self.graph.cancel(id, Actor::System, "approval expired") {
                Ok(cancelled) => {
                    stats.expired += 1;
                    for cancelled_id in cancelled {
                        self.gate.discard(cancelled_id);
                        self.cancel_signal(cancelled_id);
                    }
                }
                Err(err) => debug!(task = %id, %err, "expired approval sweep skipped task"),
            }
        }
    }

    fn spawn_execution(
        self: &Arc<Self>,
        task: Task,
        reservation: Reservation,
        degradation: DegradationLevel,
    ) {
        let token = CancellationToken::new();
        self.tokens().insert(task.id, token.clone());

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            scheduler.execute(task, reservation, degradation, token).await;
        });
        self.handles().push(handle);
    }

    /// One executor run, from `Running` to settlement.
    async fn execute(
        self: Arc<Self>,
        task: Task,
        reservation: Reservation,
        degradation: DegradationLevel,
        token: CancellationToken,
    ) {
        let id = task.id;
        let attempt = match self.graph.mark_running(id) {
            Ok(attempt) => attempt,
            Err(err) => {
                // Cancelled before the executor started: the hold is
                // released, no budget was consumed.
                debug!(task = %id, %err, "task never started, releasing reservation");
                if let Err(err) = self.ledger.release(&reservation, Utc::now()) {
                    warn!(task = %id, %err, "failed to release reservation");
                }
                self.tokens().remove(&id);
                return;
            }
        };

        let report = match self.registry.get(task.domain) {
            None => ExecutionReport::permanent(format!(
                "no executor registered for domain {}",
                task.domain
            )),
            Some(executor) => {
                let request = ExecutionRequest {
                    task_id: id,
                    org: task.org.clone(),
                    domain: task.domain,
                    payload: task.payload.clone(),
                    attempt,
                    degradation,
                    cancel: token.clone(),
                };
                match self.config.task_timeout {
                    Some(limit) => match tokio::time::timeout(limit, executor.run(request)).await {
                        Ok(report) => report,
                        Err(_) => ExecutionReport::transient(format!(
                            "timed out after {}s",
                            limit.as_secs()
                        )),
                    },
                    None => executor.run(request).await,
                }
            }
        };

        self.settle(id, attempt, &reservation, report);
        self.tokens().remove(&id);
    }

    /// Reconcile the reservation and apply the outcome transition.
    fn settle(
        &self,
        id: TaskId,
        attempt: u32,
        reservation: &Reservation,
        report: ExecutionReport,
    ) {
        let now = Utc::now();
        match self.ledger.reconcile(reservation, report.actual_cost, now) {
            Ok(settlement) => {
                if let Some(delta) = settlement.overage {
                    // Never silently absorbed: the overage becomes a ledger
                    // warning event on the task's audit trail.
                    let state = self
                        .graph
                        .get(id)
                        .map(|t| t.state)
                        .unwrap_or(TaskState::Running);
                    self.audit.record(
                        id,
                        state,
                        state,
                        Actor::System,
                        format!(
                            "ledger warning: actual cost {:.2} exceeded reservation {:.2} by {:.2}",
                            report.actual_cost, reservation.amount, delta
                        ),
                    );
                }
            }
            Err(err) => warn!(task = %id, %err, "reservation settlement failed"),
        }

        // A cancellation that landed mid-run wins; the outcome is dropped
        // (the transition table would reject it anyway).
        if matches!(self.graph.get(id).map(|t| t.state), Ok(TaskState::Cancelled)) {
            debug!(task = %id, "task cancelled during execution, outcome dropped");
            return;
        }

        let result = match report.outcome {
            ExecutionOutcome::Success => {
                info!(task = %id, cost = report.actual_cost, "task completed");
                let reason = if report.detail.is_empty() {
                    format!("completed, actual cost {:.2}", report.actual_cost)
                } else {
                    format!("completed: {}", report.detail)
                };
                self.graph.complete(id, Actor::System, reason)
            }
            ExecutionOutcome::PermanentError => {
                self.graph.fail_permanent(id, format!("permanent failure: {}", report.detail))
            }
            ExecutionOutcome::TransientError => {
                if attempt >= self.config.max_attempts {
                    self.graph.exhaust(
                        id,
                        format!("transient failure on final attempt {attempt}: {}", report.detail),
                    )
                } else {
                    let delay = backoff_delay(&self.config, attempt);
                    let retry_at = now + to_chrono(delay);
                    self.graph.fail_transient(
                        id,
                        retry_at,
                        format!("transient failure: {}", report.detail),
                    )
                }
            }
        };
        if let Err(err) = result {
            warn!(task = %id, %err, "settlement transition failed");
        }
    }

    /// Fire the cooperative cancellation signal for a task, if running.
    pub fn cancel_signal(&self, id: TaskId) {
        if let Some(token) = self.tokens().get(&id) {
            token.cancel();
        }
    }

    /// Await all currently spawned executor runs.
    pub async fn drain(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = self.handles().drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    warn!(%err, "executor run panicked");
                }
            }
        }
    }
}
