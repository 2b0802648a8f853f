//! TOML configuration for orgs and the scheduler.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use automate_approval::{OrgApprovalPolicy, PolicyTable};
use automate_core::{Domain, OrgId};
use automate_exec::SchedulerConfig;
use automate_ledger::{BudgetPeriod, OrgBudget};

/// Top-level config file.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ConfigFile {
    /// Organizations to configure at startup
    pub orgs: Vec<OrgSection>,
    /// Scheduler overrides
    pub scheduler: SchedulerSection,
}

/// One `[[orgs]]` entry.
#[derive(Debug, Deserialize)]
pub struct OrgSection {
    /// Org identifier
    pub id: String,
    /// Budget allocation per period
    pub allocated: f64,
    /// Budget period: "daily" or "monthly"
    #[serde(default = "default_period")]
    pub period: BudgetPeriod,
    /// Cap for domains without an explicit entry
    #[serde(default = "default_cap")]
    pub default_cap: usize,
    /// Per-domain concurrency caps
    #[serde(default)]
    pub caps: HashMap<Domain, usize>,
    /// Approval expiry in seconds; unanswered requests auto-cancel
    pub approval_expiry_secs: Option<u64>,
}

fn default_period() -> BudgetPeriod {
    BudgetPeriod::Daily
}

fn default_cap() -> usize {
    2
}

/// `[scheduler]` overrides; unset fields keep the defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_attempts: Option<u32>,
    pub backoff_secs: Option<u64>,
    pub task_timeout_secs: Option<u64>,
    pub pass_interval_ms: Option<u64>,
}

impl ConfigFile {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Scheduler config with the file's overrides applied.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        if let Some(max_attempts) = self.scheduler.max_attempts {
            config = config.with_max_attempts(max_attempts);
        }
        if let Some(secs) = self.scheduler.backoff_secs {
            config = config.with_backoff_base(Duration::from_secs(secs));
        }
        if let Some(secs) = self.scheduler.task_timeout_secs {
            config = config.with_task_timeout(Some(Duration::from_secs(secs)));
        }
        if let Some(millis) = self.scheduler.pass_interval_ms {
            config = config.with_pass_interval(Duration::from_millis(millis));
        }
        config
    }
}

impl OrgSection {
    /// The org id.
    pub fn org_id(&self) -> OrgId {
        OrgId::new(self.id.clone())
    }

    /// Budget built from this section.
    pub fn budget(&self) -> OrgBudget {
        let mut budget =
            OrgBudget::new(self.allocated, self.period).with_default_cap(self.default_cap);
        for (domain, cap) in &self.caps {
            budget = budget.with_cap(*domain, *cap);
        }
        budget
    }

    /// Approval policy built from this section (standard table).
    pub fn approval_policy(&self) -> OrgApprovalPolicy {
        OrgApprovalPolicy {
            table: PolicyTable::standard(),
            approval_expiry: self.approval_expiry_secs.map(Duration::from_secs),
        }
    }
}
