//! AUTOMATE budget ledger.
//!
//! The sole authority for "can this task start now": per-org, per-period
//! spend tracking with atomic check-and-reserve, per-domain concurrency
//! caps, reconciliation against executor-reported cost, and degradation
//! levels under budget pressure.

#![warn(missing_docs)]

mod budget;
mod degradation;
mod ledger;

pub use budget::{BudgetPeriod, LedgerError, OrgBudget, Reservation};
pub use degradation::{DegradationLevel, DegradationThresholds, Watermark};
pub use ledger::{BudgetLedger, BudgetUsage, Settlement};
