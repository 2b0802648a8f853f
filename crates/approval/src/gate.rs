//! The approval gate - pending requests and decision recording.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use automate_core::{
    Actor, ApprovalDecision, ApprovalMode, ApproverRole, AuditLog, Classification, Decision,
    OrgId, TaskId, TaskState, Time,
};

use crate::policy::{PolicyError, PolicyTable};

/// Per-organization approval policy.
#[derive(Debug, Clone)]
pub struct OrgApprovalPolicy {
    /// The classification table
    pub table: PolicyTable,
    /// Optional expiry after which an unanswered request auto-cancels the
    /// task; `None` means requests wait indefinitely
    pub approval_expiry: Option<Duration>,
}

impl Default for OrgApprovalPolicy {
    fn default() -> Self {
        Self {
            table: PolicyTable::standard(),
            approval_expiry: None,
        }
    }
}

/// An open approval request for one task.
///
/// Serializable so the human-facing approval UI can consume the pending
/// list directly.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    /// The task awaiting sign-off
    pub task_id: TaskId,
    /// Owning organization
    pub org: OrgId,
    /// The required approval mode
    pub mode: ApprovalMode,
    /// Decisions recorded so far, in order
    pub decisions: Vec<ApprovalDecision>,
    /// When the request was opened
    pub opened_at: Time,
    /// Expiry deadline; set once the task actually starts waiting
    pub deadline: Option<Time>,
}

impl ApprovalRequest {
    /// The role expected to decide next. `None` for `Confirm` (any
    /// authorized actor) and for resolved requests.
    pub fn next_role(&self) -> Option<ApproverRole> {
        match &self.mode {
            ApprovalMode::Chained { chain } => chain.get(self.decisions.len()).copied(),
            _ => None,
        }
    }

    fn accepts(&self, role: ApproverRole) -> bool {
        match &self.mode {
            ApprovalMode::Confirm => true,
            ApprovalMode::Chained { .. } => self.next_role() == Some(role),
            ApprovalMode::None => false,
        }
    }
}

/// Resolution status after recording a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// More decisions are required
    Pending,
    /// The request resolved positively
    Approved,
    /// The request resolved negatively
    Rejected,
}

/// Errors from the approval gate.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// No open request exists for the task
    #[error("no open approval request for task {0}")]
    UnknownRequest(TaskId),

    /// A chained request received a decision out of role order
    #[error("approval for task {task} expects {expected}, got {got}")]
    OutOfOrder {
        /// The task
        task: TaskId,
        /// The role whose decision is due
        expected: ApproverRole,
        /// The role that tried to decide
        got: ApproverRole,
    },
}

/// Classifies tasks and drives their required approval sequence.
///
/// Requests are opened at admission and archived into the audit log once
/// resolved; every recorded decision produces exactly one audit event. The
/// resulting task transition is the graph's business, not the gate's.
pub struct ApprovalGate {
    audit: Arc<AuditLog>,
    default_policy: OrgApprovalPolicy,
    policies: Mutex<HashMap<OrgId, OrgApprovalPolicy>>,
    requests: Mutex<HashMap<TaskId, ApprovalRequest>>,
}

impl ApprovalGate {
    /// Create a gate with the standard default policy.
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            audit,
            default_policy: OrgApprovalPolicy::default(),
            policies: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
        }
    }

    fn policies(&self) -> MutexGuard<'_, HashMap<OrgId, OrgApprovalPolicy>> {
        self.policies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn requests(&self) -> MutexGuard<'_, HashMap<TaskId, ApprovalRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install or replace an org's approval policy.
    pub fn set_org_policy(&self, org: OrgId, policy: OrgApprovalPolicy) {
        self.policies().insert(org, policy);
    }

    /// Classify a task's inputs under the org's policy table.
    pub fn classify(
        &self,
        org: &OrgId,
        classification: &Classification,
    ) -> Result<ApprovalMode, PolicyError> {
        let policies = self.policies();
        let policy = policies.get(org).unwrap_or(&self.default_policy);
        policy.table.classify(classification)
    }

    /// Open a request for a task whose mode requires decisions. A `None`
    /// mode opens nothing.
    pub fn open(&self, task_id: TaskId, org: OrgId, mode: ApprovalMode) {
        if !mode.requires_decision() {
            return;
        }
        self.requests().insert(
            task_id,
            ApprovalRequest {
                task_id,
                org,
                mode,
                decisions: Vec::new(),
                opened_at: Utc::now(),
                deadline: None,
            },
        );
    }

    /// All open requests.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.requests().values().cloned().collect()
    }

    /// Open requests a given role may currently decide on.
    pub fn pending_for(&self, role: ApproverRole) -> Vec<ApprovalRequest> {
        self.requests()
            .values()
            .filter(|r| r.accepts(role))
            .cloned()
            .collect()
    }

    /// Record one decision. Chained requests enforce role order and
    /// short-circuit on the first rejection; resolved requests are removed
    /// (their decisions live on in the audit log).
    pub fn decide(
        &self,
        task_id: TaskId,
        role: ApproverRole,
        actor: &str,
        decision: Decision,
        reason: Option<String>,
    ) -> Result<GateOutcome, ApprovalError> {
        let mut requests = self.requests();
        let request = requests
            .get_mut(&task_id)
            .ok_or(ApprovalError::UnknownRequest(task_id))?;

        if !request.accepts(role) {
            return Err(ApprovalError::OutOfOrder {
                task: task_id,
                expected: request.next_role().unwrap_or(role),
                got: role,
            });
        }

        request.decisions.push(ApprovalDecision {
            role,
            actor: actor.to_string(),
            decision,
            reason: reason.clone(),
            decided_at: Utc::now(),
        });

        let step = request.decisions.len();
        let note = reason.map(|r| format!(" ({r})")).unwrap_or_default();
        let outcome = match decision {
            Decision::Reject => GateOutcome::Rejected,
            Decision::Approve => match &request.mode {
                ApprovalMode::Chained { chain } if step < chain.len() => GateOutcome::Pending,
                _ => GateOutcome::Approved,
            },
        };

        let verdict = match decision {
            Decision::Approve => "approved",
            Decision::Reject => "rejected",
        };
        self.audit.record(
            task_id,
            TaskState::AwaitingApproval,
            TaskState::AwaitingApproval,
            Actor::role(role),
            format!("decision {step}: {verdict} by {actor}{note}"),
        );

        if outcome != GateOutcome::Pending {
            requests.remove(&task_id);
            debug!(task = %task_id, ?outcome, "approval request resolved");
        }
        Ok(outcome)
    }

    /// Drop the open request for a task that no longer needs one
    /// (cancelled, or cascaded away).
    pub fn discard(&self, task_id: TaskId) {
        self.requests().remove(&task_id);
    }

    /// Requests from orgs with an expiry configured whose clock has not
    /// started yet.
    pub fn unclocked(&self) -> Vec<TaskId> {
        let policies = self.policies();
        self.requests()
            .values()
            .filter(|r| r.deadline.is_none())
            .filter(|r| {
                policies
                    .get(&r.org)
                    .unwrap_or(&self.default_policy)
                    .approval_expiry
                    .is_some()
            })
            .map(|r| r.task_id)
            .collect()
    }

    /// Start the expiry clock for a task that just entered
    /// `AwaitingApproval`.
    pub fn start_clock(&self, task_id: TaskId, now: Time) {
        let expiry = {
            let policies = self.policies();
            let requests = self.requests();
            let Some(request) = requests.get(&task_id) else { return };
            policies
                .get(&request.org)
                .unwrap_or(&self.default_policy)
                .approval_expiry
        };
        let Some(expiry) = expiry else { return };
        let deadline = now + chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::zero());
        if let Some(request) = self.requests().get_mut(&task_id) {
            request.deadline = Some(deadline);
        }
    }

    /// Remove and return every request whose deadline has passed. The
    /// caller cancels the tasks.
    pub fn expired(&self, now: Time) -> Vec<TaskId> {
        let mut requests = self.requests();
        let due: Vec<TaskId> = requests
            .values()
            .filter(|r| r.deadline.map(|d| d <= now).unwrap_or(false))
            .map(|r| r.task_id)
            .collect();
        for id in &due {
            requests.remove(id);
        }
        due
    }
}
