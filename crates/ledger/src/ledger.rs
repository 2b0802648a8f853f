//! The budget ledger - the sole authority for "can this task start now".

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use automate_core::{Domain, OrgId, ReservationId, TaskId, Time};

use crate::budget::{LedgerError, OrgBudget, Reservation};
use crate::degradation::DegradationLevel;

const EPSILON: f64 = 1e-9;

struct OrgLedger {
    budget: OrgBudget,
    window_start: Time,
    reserved: f64,
    spent: f64,
    /// Overage carried from the previous period, reducing this period's
    /// effective allocation
    carried_overage: f64,
    live: HashMap<ReservationId, Reservation>,
    level: DegradationLevel,
}

impl OrgLedger {
    fn new(budget: OrgBudget, now: Time) -> Self {
        let window_start = budget.period.window_start(now);
        Self {
            budget,
            window_start,
            reserved: 0.0,
            spent: 0.0,
            carried_overage: 0.0,
            live: HashMap::new(),
            level: DegradationLevel::None,
        }
    }

    fn effective_allocation(&self) -> f64 {
        (self.budget.allocated - self.carried_overage).max(0.0)
    }

    fn spend_ratio(&self) -> f64 {
        let allocation = self.effective_allocation();
        if allocation <= 0.0 {
            return 1.0;
        }
        self.spent / allocation
    }

    fn recompute_level(&mut self) {
        self.level = self.budget.thresholds.next_level(self.level, self.spend_ratio());
    }

    /// Lazily roll into the window containing `now`, carrying any overage
    /// of the finished period into the new one's admission checks.
    fn rollover(&mut self, org: &OrgId, now: Time) {
        let start = self.budget.period.window_start(now);
        if start > self.window_start {
            self.carried_overage = (self.spent - self.budget.allocated).max(0.0);
            if self.carried_overage > 0.0 {
                warn!(
                    org = %org,
                    overage = self.carried_overage,
                    "carrying budget overage into new period"
                );
            }
            self.spent = 0.0;
            self.window_start = start;
            self.recompute_level();
        }
    }

    fn running(&self, domain: Domain) -> usize {
        self.live.values().filter(|r| r.domain == domain).count()
    }
}

/// Outcome of reconciling a reservation against actual cost.
#[derive(Debug, Clone, Copy)]
pub struct Settlement {
    /// Amount by which actual cost exceeded the reservation, if it did
    pub overage: Option<f64>,
}

/// Budget/concurrency usage for one org, for status and query feeds.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetUsage {
    /// Allocation of the current period, after overage carry
    pub allocated: f64,
    /// Outstanding reserved amount
    pub reserved: f64,
    /// Reconciled actual spend this period
    pub spent: f64,
    /// Live reservations (dispatched or running tasks)
    pub live: usize,
    /// Current degradation level
    pub level: DegradationLevel,
}

/// Tracks spend against per-org, per-period budgets and per-domain
/// concurrency caps.
///
/// One lock guards all org ledgers, so `reserve` is a single atomic
/// check-and-reserve across every concurrent dispatch attempt: no two
/// reservations can pass the same budget or cap check if doing so would
/// violate the invariant, and a failed check leaves no partial state.
#[derive(Default)]
pub struct BudgetLedger {
    inner: Mutex<HashMap<OrgId, OrgLedger>>,
}

impl BudgetLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OrgId, OrgLedger>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install or replace an org's budget. Live reservations and current
    /// spend survive reconfiguration.
    pub fn configure_org(&self, org: OrgId, budget: OrgBudget, now: Time) {
        let mut inner = self.lock();
        match inner.get_mut(&org) {
            Some(ledger) => {
                ledger.budget = budget;
                ledger.recompute_level();
            }
            None => {
                inner.insert(org.clone(), OrgLedger::new(budget, now));
            }
        }
    }

    /// Atomic dispatch admission: verify budget and concurrency headroom
    /// and place the hold, or fail with no side effects.
    pub fn reserve(
        &self,
        org: &OrgId,
        domain: Domain,
        task_id: TaskId,
        amount: f64,
        now: Time,
    ) -> Result<Reservation, LedgerError> {
        let mut inner = self.lock();
        let ledger = inner
            .get_mut(org)
            .ok_or_else(|| LedgerError::UnknownOrg(org.clone()))?;
        ledger.rollover(org, now);

        let allocation = ledger.effective_allocation();
        if ledger.spent + ledger.reserved + amount > allocation + EPSILON {
            return Err(LedgerError::BudgetExceeded {
                org: org.clone(),
                requested: amount,
                available: (allocation - ledger.spent - ledger.reserved).max(0.0),
            });
        }

        let cap = ledger.budget.cap(domain);
        if ledger.running(domain) >= cap {
            return Err(LedgerError::ConcurrencyCapReached {
                org: org.clone(),
                domain,
                cap,
            });
        }

        let reservation = Reservation {
            id: ReservationId::new(),
            org: org.clone(),
            domain,
            task_id,
            amount,
        };
        ledger.reserved += amount;
        ledger.live.insert(reservation.id, reservation.clone());
        ledger.recompute_level();
        debug!(org = %org, %domain, task = %task_id, amount, "reservation granted");
        Ok(reservation)
    }

    /// Move a reservation into spend using the executor-reported actual
    /// cost. Overage is reported to the caller, never silently absorbed;
    /// it is also factored into the next period via rollover carry.
    pub fn reconcile(
        &self,
        reservation: &Reservation,
        actual: f64,
        now: Time,
    ) -> Result<Settlement, LedgerError> {
        let mut inner = self.lock();
        let ledger = inner
            .get_mut(&reservation.org)
            .ok_or_else(|| LedgerError::UnknownOrg(reservation.org.clone()))?;
        ledger.rollover(&reservation.org, now);

        ledger
            .live
            .remove(&reservation.id)
            .ok_or(LedgerError::UnknownReservation(reservation.id))?;
        ledger.reserved = (ledger.reserved - reservation.amount).max(0.0);
        ledger.spent += actual;
        ledger.recompute_level();

        let overage = (actual > reservation.amount + EPSILON).then(|| actual - reservation.amount);
        if let Some(delta) = overage {
            warn!(
                org = %reservation.org,
                task = %reservation.task_id,
                reserved = reservation.amount,
                actual,
                delta,
                "actual cost exceeded reservation"
            );
        }
        Ok(Settlement { overage })
    }

    /// Drop a hold for a task that never ran (cancellation, or failure
    /// before start).
    pub fn release(&self, reservation: &Reservation, now: Time) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        let ledger = inner
            .get_mut(&reservation.org)
            .ok_or_else(|| LedgerError::UnknownOrg(reservation.org.clone()))?;
        ledger.rollover(&reservation.org, now);

        ledger
            .live
            .remove(&reservation.id)
            .ok_or(LedgerError::UnknownReservation(reservation.id))?;
        ledger.reserved = (ledger.reserved - reservation.amount).max(0.0);
        ledger.recompute_level();
        Ok(())
    }

    /// The degradation level the scheduler must honor for this org.
    pub fn degradation(&self, org: &OrgId, now: Time) -> DegradationLevel {
        let mut inner = self.lock();
        match inner.get_mut(org) {
            Some(ledger) => {
                ledger.rollover(org, now);
                ledger.level
            }
            None => DegradationLevel::None,
        }
    }

    /// Usage snapshot for one org.
    pub fn usage(&self, org: &OrgId, now: Time) -> Option<BudgetUsage> {
        let mut inner = self.lock();
        let ledger = inner.get_mut(org)?;
        ledger.rollover(org, now);
        Some(BudgetUsage {
            allocated: ledger.effective_allocation(),
            reserved: ledger.reserved,
            spent: ledger.spent,
            live: ledger.live.len(),
            level: ledger.level,
        })
    }
}
