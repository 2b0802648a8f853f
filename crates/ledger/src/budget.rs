//! Budget configuration, reservations and ledger errors.

use std::collections::HashMap;

use chrono::{Datelike, NaiveTime};
use serde::{Deserialize, Serialize};

use automate_core::{Domain, OrgId, ReservationId, TaskId, Time};

use crate::degradation::DegradationThresholds;

/// The window a budget allocation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// Resets at midnight UTC
    Daily,
    /// Resets on the first of the month, UTC
    Monthly,
}

impl BudgetPeriod {
    /// Start of the window containing `now`.
    pub fn window_start(&self, now: Time) -> Time {
        let date = match self {
            Self::Daily => now.date_naive(),
            Self::Monthly => now.date_naive().with_day(1).unwrap_or(now.date_naive()),
        };
        date.and_time(NaiveTime::MIN).and_utc()
    }
}

/// Per-organization budget and concurrency configuration.
#[derive(Debug, Clone)]
pub struct OrgBudget {
    /// Allocation for each period window
    pub allocated: f64,
    /// Window the allocation covers
    pub period: BudgetPeriod,
    /// Cap applied to domains without an explicit entry
    pub default_cap: usize,
    /// Per-domain concurrency caps
    pub caps: HashMap<Domain, usize>,
    /// Degradation watermarks
    pub thresholds: DegradationThresholds,
}

impl OrgBudget {
    /// Create a budget with the default cap of 2 per domain.
    pub fn new(allocated: f64, period: BudgetPeriod) -> Self {
        Self {
            allocated,
            period,
            default_cap: 2,
            caps: HashMap::new(),
            thresholds: DegradationThresholds::default(),
        }
    }

    /// Set the cap for one domain.
    pub fn with_cap(mut self, domain: Domain, cap: usize) -> Self {
        self.caps.insert(domain, cap);
        self
    }

    /// Set the cap applied to domains without an explicit entry.
    pub fn with_default_cap(mut self, cap: usize) -> Self {
        self.default_cap = cap;
        self
    }

    /// Set the degradation watermarks.
    pub fn with_thresholds(mut self, thresholds: DegradationThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// The concurrency cap for a domain.
    pub fn cap(&self, domain: Domain) -> usize {
        self.caps.get(&domain).copied().unwrap_or(self.default_cap)
    }
}

/// A provisional budget/concurrency hold placed at dispatch time.
///
/// Later reconciled against the executor-reported actual cost, or released
/// if the task never ran.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Unique reservation id
    pub id: ReservationId,
    /// Organization the hold is against
    pub org: OrgId,
    /// Domain counted against the concurrency cap
    pub domain: Domain,
    /// The task the hold is for
    pub task_id: TaskId,
    /// Reserved amount
    pub amount: f64,
}

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The reservation would push spend past the allocation
    #[error("budget exceeded for org {org}: requested {requested:.2}, available {available:.2}")]
    BudgetExceeded {
        /// The org
        org: OrgId,
        /// Requested reservation amount
        requested: f64,
        /// Remaining admissible amount
        available: f64,
    },

    /// The (org, domain) pair is already running at its cap
    #[error("concurrency cap reached for {org}/{domain}: {cap} running")]
    ConcurrencyCapReached {
        /// The org
        org: OrgId,
        /// The domain
        domain: Domain,
        /// The configured cap
        cap: usize,
    },

    /// No budget was configured for the org
    #[error("no budget configured for org {0}")]
    UnknownOrg(OrgId),

    /// The reservation is not live (already settled or never issued)
    #[error("unknown reservation: {0}")]
    UnknownReservation(ReservationId),
}
