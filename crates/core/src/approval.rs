//! Approval vocabulary - modes, roles and recorded decisions.

use serde::{Deserialize, Serialize};

use crate::Time;

/// A role that may be asked to sign off on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverRole {
    /// The party that proposed the task
    Requester,
    /// Lead of the owning domain pillar
    DomainLead,
    /// Compliance officer
    Compliance,
}

impl std::fmt::Display for ApproverRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requester => write!(f, "requester"),
            Self::DomainLead => write!(f, "domain-lead"),
            Self::Compliance => write!(f, "compliance"),
        }
    }
}

/// Required human sign-off pattern before a task may be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ApprovalMode {
    /// No sign-off required
    None,

    /// A single decision from any authorized actor
    Confirm,

    /// Decisions required in role order; an early rejection short-circuits
    Chained {
        /// Ordered approver roles
        chain: Vec<ApproverRole>,
    },
}

impl ApprovalMode {
    /// Whether this mode requires at least one human decision.
    pub fn requires_decision(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Approve or reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Positive sign-off
    Approve,
    /// Negative sign-off; terminal for the task
    Reject,
}

/// A single recorded decision on an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Role the decision was made under
    pub role: ApproverRole,

    /// The concrete actor (user id) behind the role
    pub actor: String,

    /// The decision taken
    pub decision: Decision,

    /// Optional free-form reason
    pub reason: Option<String>,

    /// When the decision was recorded
    pub decided_at: Time,
}
