//! Audit event log - append-only record of every state transition.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::approval::ApproverRole;
use crate::id::TaskId;
use crate::task::TaskState;
use crate::Time;

/// Who performed an audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    /// The scheduler or another core component
    System,
    /// A concrete user
    User {
        /// User identifier
        id: String,
    },
    /// An approver acting under a role
    Role {
        /// The approver role
        role: ApproverRole,
    },
}

impl Actor {
    /// Actor for a named user.
    pub fn user(id: impl Into<String>) -> Self {
        Self::User { id: id.into() }
    }

    /// Actor for an approver role.
    pub fn role(role: ApproverRole) -> Self {
        Self::Role { role }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User { id } => write!(f, "user:{id}"),
            Self::Role { role } => write!(f, "role:{role}"),
        }
    }
}

/// One audited change on a task.
///
/// Events where `from_state == to_state` record non-transition facts
/// (an intermediate approval decision, a ledger warning). Events are never
/// mutated or deleted; corrections are represented as new events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Per-task sequence number, strictly increasing from 1
    pub seq: u64,

    /// The task this event belongs to
    pub task_id: TaskId,

    /// State before the change
    pub from_state: TaskState,

    /// State after the change
    pub to_state: TaskState,

    /// Who caused the change
    pub actor: Actor,

    /// Why the change happened
    pub reason: String,

    /// When the event was recorded
    pub timestamp: Time,
}

#[derive(Default)]
struct AuditLogInner {
    /// Global append order
    events: Vec<AuditEvent>,
    /// task -> indexes into `events`
    by_task: HashMap<TaskId, Vec<usize>>,
    /// task -> next sequence number
    next_seq: HashMap<TaskId, u64>,
}

/// Append-only, strictly ordered audit log.
///
/// The sole answer to "why did this run": every state transition and every
/// approval decision lands here with actor and reason.
#[derive(Default)]
pub struct AuditLog {
    inner: Mutex<AuditLogInner>,
}

impl AuditLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AuditLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event for `task_id`, assigning the next sequence number.
    pub fn record(
        &self,
        task_id: TaskId,
        from_state: TaskState,
        to_state: TaskState,
        actor: Actor,
        reason: impl Into<String>,
    ) -> u64 {
        let mut inner = self.lock();
        let next = inner.next_seq.entry(task_id).or_insert(1);
        let seq = *next;
        *next += 1;

        let index = inner.events.len();
        inner.events.push(AuditEvent {
            seq,
            task_id,
            from_state,
            to_state,
            actor,
            reason: reason.into(),
            timestamp: chrono::Utc::now(),
        });
        inner.by_task.entry(task_id).or_default().push(index);
        seq
    }

    /// Full ordered history for one task.
    pub fn history(&self, task_id: TaskId) -> Vec<AuditEvent> {
        let inner = self.lock();
        inner
            .by_task
            .get(&task_id)
            .map(|indexes| indexes.iter().map(|&i| inner.events[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Total number of recorded events.
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_per_task_and_strictly_increasing() {
        let log = AuditLog::new();
        let a = TaskId::new();
        let b = TaskId::new();

        log.record(a, TaskState::Pending, TaskState::Ready, Actor::System, "deps clear");
        log.record(b, TaskState::Pending, TaskState::Blocked, Actor::System, "waiting");
        log.record(a, TaskState::Ready, TaskState::Approved, Actor::System, "no approval");

        let history_a = log.history(a);
        let history_b = log.history(b);
        assert_eq!(history_a.len(), 2);
        assert_eq!(history_b.len(), 1);
        assert_eq!(history_a[0].seq, 1);
        assert_eq!(history_a[1].seq, 2);
        assert_eq!(history_b[0].seq, 1);
    }

    #[test]
    fn test_history_preserves_append_order() {
        let log = AuditLog::new();
        let id = TaskId::new();
        let states = [
            (TaskState::Pending, TaskState::Ready),
            (TaskState::Ready, TaskState::Approved),
            (TaskState::Approved, TaskState::Dispatched),
            (TaskState::Dispatched, TaskState::Running),
        ];
        for (from, to) in states {
            log.record(id, from, to, Actor::System, "step");
        }

        let history = log.history(id);
        let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(history[3].to_state, TaskState::Running);
    }

    #[test]
    fn test_unknown_task_has_empty_history() {
        let log = AuditLog::new();
        assert!(log.history(TaskId::new()).is_empty());
        assert!(log.is_empty());
    }
}
