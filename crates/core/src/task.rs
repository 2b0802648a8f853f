//! Task model - the unit of governed work.

use serde::{Deserialize, Serialize};

use crate::approval::ApprovalMode;
use crate::id::{OrgId, TaskId};
use crate::Time;

/// Owning pillar for a task; selects the executor capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Press relations
    Pr,
    /// Content production
    Content,
    /// Search optimization
    Seo,
    /// Outreach and partnerships
    Outreach,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pr => write!(f, "pr"),
            Self::Content => write!(f, "content"),
            Self::Seo => write!(f, "seo"),
            Self::Outreach => write!(f, "outreach"),
        }
    }
}

/// Whether a task's effect is confined internally or reaches an external party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Externality {
    /// Effect stays inside the organization
    Internal,
    /// Effect reaches an external party (publish/send)
    External,
}

/// Risk classification driving approval strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Low risk
    Low,
    /// Medium risk
    Medium,
    /// High risk
    High,
}

/// Category of spend a task incurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    /// No spend
    None,
    /// LLM inference cost
    Llm,
    /// Third-party API cost
    Api,
}

/// Classification inputs that drive the approval mode for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Internal or external effect
    pub externality: Externality,
    /// Risk tier
    pub risk_tier: RiskTier,
    /// Spend category
    pub cost_class: CostClass,
    /// Whether compliance review is mandated
    pub compliance_required: bool,
}

/// Task lifecycle state.
///
/// Initial state is `Pending`; terminals are `Completed`, `Rejected`,
/// `Cancelled` and `FailedPermanent`. A `FailedPermanent` task may still be
/// re-queued through the Control API (manual retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted, not yet evaluated or waiting out a retry backoff
    Pending,
    /// Has incomplete dependencies
    Blocked,
    /// All dependencies completed
    Ready,
    /// Blocked on human sign-off
    AwaitingApproval,
    /// Cleared for dispatch
    Approved,
    /// Reservation granted, handed to an executor
    Dispatched,
    /// Executor is working
    Running,
    /// Finished successfully
    Completed,
    /// Failed with a retryable error
    FailedTransient,
    /// Failed with no retry remaining
    FailedPermanent,
    /// A negative approval decision was recorded
    Rejected,
    /// Explicitly cancelled, or cascaded from a rejected/cancelled dependency
    Cancelled,
}

impl TaskState {
    /// Check if this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Cancelled | Self::FailedPermanent
        )
    }

    /// Check whether a transition from this state to `to` is legal.
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;

        // Any non-terminal state may be cancelled.
        if to == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, to),
            (Pending, Blocked)
                | (Pending, Ready)
                | (Blocked, Ready)
                | (Ready, AwaitingApproval)
                | (Ready, Approved)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
                | (Approved, Dispatched)
                | (Dispatched, Running)
                | (Running, Completed)
                | (Running, FailedTransient)
                | (Running, FailedPermanent)
                | (FailedTransient, Pending)
                | (FailedTransient, FailedPermanent)
                | (FailedPermanent, Pending)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::FailedTransient => "failed_transient",
            Self::FailedPermanent => "failed_permanent",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// A task admitted into the graph.
///
/// Owned by the task graph; state is mutated only through validated
/// transitions so that every change is audited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Owning organization
    pub org: OrgId,

    /// Owning pillar
    pub domain: Domain,

    /// Opaque payload reference, interpreted only by the executor
    pub payload: serde_json::Value,

    /// Tasks that must complete before this one may become ready
    pub depends_on: Vec<TaskId>,

    /// Internal or external effect
    pub externality: Externality,

    /// Risk tier
    pub risk_tier: RiskTier,

    /// Spend category
    pub cost_class: CostClass,

    /// Whether compliance review is mandated
    pub compliance_required: bool,

    /// Scheduling priority (higher first)
    pub priority: u8,

    /// Reservation amount supplied at creation
    pub estimated_cost: f64,

    /// Current lifecycle state
    pub state: TaskState,

    /// Number of execution attempts so far
    pub attempts: u32,

    /// Earliest time a re-queued task may become ready again
    pub retry_at: Option<Time>,

    /// Approval mode stamped at classification
    pub approval_mode: Option<ApprovalMode>,

    /// Whether a required approval has been granted; survives re-queue
    pub approved: bool,

    /// Creation timestamp
    pub created_at: Time,

    /// Last update timestamp
    pub updated_at: Time,
}

impl Task {
    /// The classification inputs that produced this task's approval mode.
    pub fn classification(&self) -> Classification {
        Classification {
            externality: self.externality,
            risk_tier: self.risk_tier,
            cost_class: self.cost_class,
            compliance_required: self.compliance_required,
        }
    }

    /// Whether this task still requires a human decision before dispatch.
    pub fn needs_approval(&self) -> bool {
        !self.approved
            && self
                .approval_mode
                .as_ref()
                .map(ApprovalMode::requires_decision)
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Rejected.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::FailedPermanent.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::AwaitingApproval.is_terminal());
    }

    #[test]
    fn test_happy_path_transitions() {
        use TaskState::*;
        let path = [
            Pending,
            Blocked,
            Ready,
            AwaitingApproval,
            Approved,
            Dispatched,
            Running,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_any_non_terminal_state_may_cancel() {
        use TaskState::*;
        for state in [
            Pending,
            Blocked,
            Ready,
            AwaitingApproval,
            Approved,
            Dispatched,
            Running,
            FailedTransient,
        ] {
            assert!(state.can_transition(Cancelled), "{state:?}");
        }
        for state in [Completed, Rejected, Cancelled, FailedPermanent] {
            assert!(!state.can_transition(Cancelled), "{state:?}");
        }
    }

    #[test]
    fn test_requeue_transitions() {
        use TaskState::*;
        assert!(FailedTransient.can_transition(Pending));
        assert!(FailedTransient.can_transition(FailedPermanent));
        // Manual retry path.
        assert!(FailedPermanent.can_transition(Pending));
        // No path back from the other terminals.
        assert!(!Completed.can_transition(Pending));
        assert!(!Rejected.can_transition(Pending));
    }

    #[test]
    fn test_illegal_transitions() {
        use TaskState::*;
        assert!(!Pending.can_transition(Running));
        assert!(!Ready.can_transition(Dispatched));
        assert!(!Approved.can_transition(Running));
        assert!(!Completed.can_transition(Running));
        assert!(!Cancelled.can_transition(Running));
    }

    #[test]
    fn test_needs_approval() {
        let mut task = Task {
            id: TaskId::new(),
            org: OrgId::new("acme"),
            domain: Domain::Content,
            payload: serde_json::Value::Null,
            depends_on: vec![],
            externality: Externality::Internal,
            risk_tier: RiskTier::Low,
            cost_class: CostClass::None,
            compliance_required: false,
            priority: 128,
            estimated_cost: 0.0,
            state: TaskState::Pending,
            attempts: 0,
            retry_at: None,
            approval_mode: Some(ApprovalMode::Confirm),
            approved: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(task.needs_approval());

        task.approved = true;
        assert!(!task.needs_approval());

        task.approved = false;
        task.approval_mode = Some(ApprovalMode::None);
        assert!(!task.needs_approval());

        let classification = task.classification();
        assert_eq!(classification.externality, task.externality);
        assert_eq!(classification.cost_class, task.cost_class);
        assert!(!classification.compliance_required);
    }
}
