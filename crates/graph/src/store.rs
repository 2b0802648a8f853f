//! The task graph store - lifecycle transitions, readiness propagation and
//! cascading cancellation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use automate_core::{Actor, ApprovalMode, AuditLog, Task, TaskId, TaskState, Time};

use crate::admission::{validate_batch, TaskSpec};

/// Errors from graph admission and task transitions.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The submitted batch contains a dependency cycle
    #[error("dependency cycle detected involving {} task(s)", .members.len())]
    Cycle {
        /// Tasks participating in the cycle
        members: Vec<TaskId>,
    },

    /// A dependency id resolves to neither the batch nor the prior graph
    #[error("task {task} references unknown dependency {dependency}")]
    UnknownDependency {
        /// The referencing task
        task: TaskId,
        /// The missing dependency
        dependency: TaskId,
    },

    /// A batch member reuses an id already admitted
    #[error("task already exists: {0}")]
    DuplicateTask(TaskId),

    /// No task with this id was ever admitted
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// The requested transition is not legal from the task's current state
    #[error("invalid transition {from} -> {to} for task {task}")]
    InvalidTransition {
        /// The task
        task: TaskId,
        /// Current state
        from: TaskState,
        /// Requested state
        to: TaskState,
    },
}

/// Point-in-time view of the whole graph for the Query API.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    /// When the snapshot was taken
    pub taken_at: Time,
    /// All admitted tasks, terminal ones included
    pub tasks: Vec<Task>,
}

impl GraphSnapshot {
    /// Dependency edges as (task, depends-on) pairs.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.tasks
            .iter()
            .flat_map(|t| t.depends_on.iter().map(move |d| (t.id, *d)))
            .collect()
    }
}

#[derive(Default)]
struct GraphInner {
    tasks: HashMap<TaskId, Task>,
    /// Reverse adjacency: dependency -> tasks that depend on it
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl GraphInner {
    /// Apply one validated transition and record exactly one audit event.
    fn apply(
        &mut self,
        audit: &AuditLog,
        id: TaskId,
        to: TaskState,
        actor: Actor,
        reason: impl Into<String>,
    ) -> Result<(), GraphError> {
        let task = self.tasks.get_mut(&id).ok_or(GraphError::UnknownTask(id))?;
        let from = task.state;
        if !from.can_transition(to) {
            return Err(GraphError::InvalidTransition { task: id, from, to });
        }
        task.state = to;
        task.updated_at = Utc::now();
        audit.record(id, from, to, actor, reason);
        Ok(())
    }

    fn state_of(&self, id: TaskId) -> Result<TaskState, GraphError> {
        self.tasks
            .get(&id)
            .map(|t| t.state)
            .ok_or(GraphError::UnknownTask(id))
    }

    fn deps_complete(&self, id: TaskId) -> bool {
        self.tasks
            .get(&id)
            .map(|task| {
                task.depends_on.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .map(|t| t.state == TaskState::Completed)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// Re-evaluate a `Pending`/`Blocked` task. Promotes through `Ready` to
    /// `Approved` or `AwaitingApproval`; backed-off tasks stay `Pending`
    /// until their delay elapses. Returns the resulting state when it changed.
    fn promote(&mut self, audit: &AuditLog, id: TaskId, now: Time) -> Option<TaskState> {
        let task = self.tasks.get(&id)?;
        if !matches!(task.state, TaskState::Pending | TaskState::Blocked) {
            return None;
        }

        if !self.deps_complete(id) {
            if self.state_of(id).ok()? == TaskState::Pending {
                self.apply(audit, id, TaskState::Blocked, Actor::System, "waiting on dependencies")
                    .ok()?;
                return Some(TaskState::Blocked);
            }
            return None;
        }

        if let Some(task) = self.tasks.get(&id) {
            if task.retry_at.map(|at| at > now).unwrap_or(false) {
                return None;
            }
        }

        self.apply(audit, id, TaskState::Ready, Actor::System, "dependencies complete")
            .ok()?;
        if let Some(task) = self.tasks.get_mut(&id) {
            task.retry_at = None;
        }

        let needs_approval = self.tasks.get(&id).map(|t| t.needs_approval()).unwrap_or(false);
        if needs_approval {
            self.apply(audit, id, TaskState::AwaitingApproval, Actor::System, "approval required")
                .ok()?;
            Some(TaskState::AwaitingApproval)
        } else {
            self.apply(audit, id, TaskState::Approved, Actor::System, "cleared for dispatch")
                .ok()?;
            Some(TaskState::Approved)
        }
    }

    /// Cancel every transitive dependent of `root` that is not yet terminal.
    fn cascade_cancel(
        &mut self,
        audit: &AuditLog,
        root: TaskId,
        cause: &str,
    ) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut seen: HashSet<TaskId> = [root].into_iter().collect();
        let mut queue: VecDeque<TaskId> =
            self.dependents.get(&root).cloned().unwrap_or_default().into();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Ok(state) = self.state_of(id) else { continue };
            if !state.is_terminal() {
                let reason = format!("dependency {root} {cause}");
                if self.apply(audit, id, TaskState::Cancelled, Actor::System, reason).is_ok() {
                    cancelled.push(id);
                }
            }
            if let Some(next) = self.dependents.get(&id) {
                queue.extend(next.iter().copied());
            }
        }

        cancelled
    }

    /// Re-evaluate the direct dependents of a task that just settled.
    fn reevaluate_dependents(&mut self, audit: &AuditLog, id: TaskId, now: Time) {
        let dependents = self.dependents.get(&id).cloned().unwrap_or_default();
        for dependent in dependents {
            self.promote(audit, dependent, now);
        }
    }
}

/// The task graph: admission, per-task atomic transitions, and the event
/// feed for everything that happens to a task.
///
/// All mutation goes through one lock, so no two writers can apply
/// conflicting transitions, and every applied transition lands in the audit
/// log exactly once.
pub struct GraphStore {
    audit: Arc<AuditLog>,
    inner: Mutex<GraphInner>,
}

impl GraphStore {
    /// Create an empty graph writing to the given audit log.
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            audit,
            inner: Mutex::new(GraphInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a batch of tasks. The whole batch is validated first; on error
    /// nothing is admitted.
    pub fn submit(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>, GraphError> {
        let mut inner = self.lock();
        let existing: HashSet<TaskId> = inner.tasks.keys().copied().collect();
        validate_batch(&specs, &existing)?;

        let now = Utc::now();
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = spec.id;
            for dep in &spec.depends_on {
                inner.dependents.entry(*dep).or_default().push(id);
            }
            inner.tasks.insert(id, spec.into_task(now));
            self.audit.record(
                id,
                TaskState::Pending,
                TaskState::Pending,
                Actor::System,
                "admitted into task graph",
            );
            ids.push(id);
        }
        debug!(count = ids.len(), "admitted task batch");
        Ok(ids)
    }

    /// Stamp the classified approval mode onto a task.
    pub fn set_approval_mode(&self, id: TaskId, mode: ApprovalMode) -> Result<(), GraphError> {
        let mut inner = self.lock();
        let task = inner.tasks.get_mut(&id).ok_or(GraphError::UnknownTask(id))?;
        task.approval_mode = Some(mode);
        Ok(())
    }

    /// Run the initial evaluation of a freshly admitted task.
    pub fn activate(&self, id: TaskId) -> Result<TaskState, GraphError> {
        let mut inner = self.lock();
        let now = Utc::now();
        match inner.promote(&self.audit, id, now) {
            Some(state) => Ok(state),
            None => inner.state_of(id),
        }
    }

    /// Snapshot of one task.
    pub fn get(&self, id: TaskId) -> Result<Task, GraphError> {
        self.lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(GraphError::UnknownTask(id))
    }

    /// Record a granted approval: `AwaitingApproval -> Approved`.
    pub fn mark_approved(
        &self,
        id: TaskId,
        actor: Actor,
        reason: impl Into<String>,
    ) -> Result<(), GraphError> {
        let mut inner = self.lock();
        inner.apply(&self.audit, id, TaskState::Approved, actor, reason)?;
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.approved = true;
        }
        Ok(())
    }

    /// Record a negative approval decision: the task is `Rejected` and every
    /// transitive dependent is cancelled - a rejected task can never satisfy
    /// a dependent. Returns the cancelled dependents.
    pub fn mark_rejected(
        &self,
        id: TaskId,
        actor: Actor,
        reason: impl Into<String>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let mut inner = self.lock();
        inner.apply(&self.audit, id, TaskState::Rejected, actor, reason)?;
        Ok(inner.cascade_cancel(&self.audit, id, "rejected"))
    }

    /// Explicitly cancel a task and cascade to its transitive dependents.
    /// Returns all newly cancelled tasks, the root included.
    pub fn cancel(
        &self,
        id: TaskId,
        actor: Actor,
        reason: impl Into<String>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let mut inner = self.lock();
        inner.apply(&self.audit, id, TaskState::Cancelled, actor, reason)?;
        let mut cancelled = vec![id];
        cancelled.extend(inner.cascade_cancel(&self.audit, id, "cancelled"));
        Ok(cancelled)
    }

    /// `Approved -> Dispatched` after a successful budget reservation.
    pub fn mark_dispatched(&self, id: TaskId) -> Result<(), GraphError> {
        self.lock().apply(
            &self.audit,
            id,
            TaskState::Dispatched,
            Actor::System,
            "budget reservation granted",
        )
    }

    /// `Dispatched -> Running`; counts the attempt. Returns the attempt
    /// number now in flight.
    pub fn mark_running(&self, id: TaskId) -> Result<u32, GraphError> {
        let mut inner = self.lock();
        let attempt = inner
            .tasks
            .get(&id)
            .map(|t| t.attempts + 1)
            .ok_or(GraphError::UnknownTask(id))?;
        inner.apply(
            &self.audit,
            id,
            TaskState::Running,
            Actor::System,
            format!("executor started, attempt {attempt}"),
        )?;
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.attempts = attempt;
        }
        Ok(attempt)
    }

    /// `Running -> Completed`, then re-evaluate dependents.
    pub fn complete(
        &self,
        id: TaskId,
        actor: Actor,
        reason: impl Into<String>,
    ) -> Result<(), GraphError> {
        let mut inner = self.lock();
        inner.apply(&self.audit, id, TaskState::Completed, actor, reason)?;
        inner.reevaluate_dependents(&self.audit, id, Utc::now());
        Ok(())
    }

    /// Transient failure with retry budget left: re-queue with a backoff
    /// gate. The task passes through `FailedTransient` back to `Pending`.
    pub fn fail_transient(
        &self,
        id: TaskId,
        retry_at: Time,
        reason: impl Into<String>,
    ) -> Result<(), GraphError> {
        let mut inner = self.lock();
        inner.apply(&self.audit, id, TaskState::FailedTransient, Actor::System, reason)?;
        inner.apply(
            &self.audit,
            id,
            TaskState::Pending,
            Actor::System,
            format!("re-queued, backoff until {retry_at}"),
        )?;
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.retry_at = Some(retry_at);
        }
        Ok(())
    }

    /// Transient failure with no retry budget left: the task passes through
    /// `FailedTransient` to `FailedPermanent`.
    pub fn exhaust(&self, id: TaskId, reason: impl Into<String>) -> Result<(), GraphError> {
        let mut inner = self.lock();
        inner.apply(&self.audit, id, TaskState::FailedTransient, Actor::System, reason)?;
        inner.apply(
            &self.audit,
            id,
            TaskState::FailedPermanent,
            Actor::System,
            "retry attempts exhausted",
        )
    }

    /// Permanent failure: terminal, surfaced, no retry.
    pub fn fail_permanent(
        &self,
        id: TaskId,
        reason: impl Into<String>,
    ) -> Result<(), GraphError> {
        self.lock()
            .apply(&self.audit, id, TaskState::FailedPermanent, Actor::System, reason)
    }

    /// Manual re-queue of a `FailedPermanent` task (Control API). Resets the
    /// attempt counter and immediately re-evaluates the task.
    pub fn requeue(&self, id: TaskId, actor: Actor) -> Result<TaskState, GraphError> {
        let mut inner = self.lock();
        inner.apply(&self.audit, id, TaskState::Pending, actor, "manual retry")?;
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.attempts = 0;
            task.retry_at = None;
        }
        let now = Utc::now();
        match inner.promote(&self.audit, id, now) {
            Some(state) => Ok(state),
            None => inner.state_of(id),
        }
    }

    /// Re-evaluate all `Pending`/`Blocked` tasks whose backoff has elapsed.
    /// Returns how many tasks changed state.
    pub fn promote_due(&self, now: Time) -> usize {
        let mut inner = self.lock();
        let candidates: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Pending | TaskState::Blocked))
            .map(|t| t.id)
            .collect();
        candidates
            .into_iter()
            .filter(|id| inner.promote(&self.audit, *id, now).is_some())
            .count()
    }

    /// Snapshot of every task currently cleared for dispatch.
    pub fn approved_candidates(&self) -> Vec<Task> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Approved)
            .cloned()
            .collect()
    }

    /// Whether any task can still make progress without human input.
    pub fn has_live_work(&self) -> bool {
        self.lock().tasks.values().any(|t| {
            matches!(
                t.state,
                TaskState::Pending
                    | TaskState::Ready
                    | TaskState::Approved
                    | TaskState::Dispatched
                    | TaskState::Running
            )
        })
    }

    /// Earliest backoff deadline among re-queued tasks, if any.
    pub fn earliest_retry(&self) -> Option<Time> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .filter_map(|t| t.retry_at)
            .min()
    }

    /// Task counts per state, for status reporting.
    pub fn counts(&self) -> HashMap<TaskState, usize> {
        let mut counts = HashMap::new();
        for task in self.lock().tasks.values() {
            *counts.entry(task.state).or_insert(0) += 1;
        }
        counts
    }

    /// Point-in-time snapshot for the Query API.
    pub fn snapshot(&self) -> GraphSnapshot {
        let mut tasks: Vec<Task> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        GraphSnapshot {
            taken_at: Utc::now(),
            tasks,
        }
    }
}
