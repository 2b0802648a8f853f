//! Approval policy - the enumerated classification table.

use std::collections::HashMap;

use automate_core::{
    ApprovalMode, ApproverRole, Classification, CostClass, Externality, RiskTier,
};

/// All externality values, for completeness validation.
pub const EXTERNALITIES: [Externality; 2] = [Externality::Internal, Externality::External];

/// All risk tiers, for completeness validation.
pub const RISK_TIERS: [RiskTier; 3] = [RiskTier::Low, RiskTier::Medium, RiskTier::High];

/// All cost classes, for completeness validation.
pub const COST_CLASSES: [CostClass; 3] = [CostClass::None, CostClass::Llm, CostClass::Api];

/// Errors from policy lookup and validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    /// The table defines no mode for a classification combination
    #[error("no approval mode defined for {externality:?}/{risk_tier:?}/{cost_class:?}")]
    Missing {
        /// Externality of the undefined combination
        externality: Externality,
        /// Risk tier of the undefined combination
        risk_tier: RiskTier,
        /// Cost class of the undefined combination
        cost_class: CostClass,
    },
}

/// An explicit enumerated policy map from classification inputs to the
/// required approval mode.
///
/// Every combination must have a defined mode (`validate`), so org policy
/// can be checked statically instead of interpreting ad hoc rules at run
/// time. `compliance_required` always forces a chained approval, regardless
/// of the table entry.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: HashMap<(Externality, RiskTier, CostClass), ApprovalMode>,
    /// Chain applied for `Chained` entries and the compliance override
    chain: Vec<ApproverRole>,
}

impl PolicyTable {
    /// An empty table with the given approver chain.
    pub fn new(chain: Vec<ApproverRole>) -> Self {
        Self {
            entries: HashMap::new(),
            chain,
        }
    }

    /// The standard table: internal+low with no spend runs unattended;
    /// spend or medium risk or any external effect needs a confirmation;
    /// high risk or external+medium escalates to the full chain.
    pub fn standard() -> Self {
        let mut table = Self::new(vec![
            ApproverRole::Requester,
            ApproverRole::DomainLead,
            ApproverRole::Compliance,
        ]);
        for cost_class in COST_CLASSES {
            for externality in EXTERNALITIES {
                for risk_tier in RISK_TIERS {
                    let mode = match (externality, risk_tier, cost_class) {
                        (Externality::Internal, RiskTier::Low, CostClass::None) => {
                            ApprovalMode::None
                        }
                        (Externality::Internal, RiskTier::Low, _)
                        | (Externality::Internal, RiskTier::Medium, _)
                        | (Externality::External, RiskTier::Low, _) => ApprovalMode::Confirm,
                        _ => ApprovalMode::Chained {
                            chain: table.chain.clone(),
                        },
                    };
                    table.set(externality, risk_tier, cost_class, mode);
                }
            }
        }
        table
    }

    /// Define or replace one entry.
    pub fn set(
        &mut self,
        externality: Externality,
        risk_tier: RiskTier,
        cost_class: CostClass,
        mode: ApprovalMode,
    ) {
        self.entries.insert((externality, risk_tier, cost_class), mode);
    }

    /// The approver chain used by `Chained` entries.
    pub fn chain(&self) -> &[ApproverRole] {
        &self.chain
    }

    /// Pure classification: map inputs to the required approval mode.
    pub fn classify(&self, classification: &Classification) -> Result<ApprovalMode, PolicyError> {
        if classification.compliance_required {
            return Ok(ApprovalMode::Chained {
                chain: self.chain.clone(),
            });
        }
        self.entries
            .get(&(
                classification.externality,
                classification.risk_tier,
                classification.cost_class,
            ))
            .cloned()
            .ok_or(PolicyError::Missing {
                externality: classification.externality,
                risk_tier: classification.risk_tier,
                cost_class: classification.cost_class,
            })
    }

    /// Static completeness check: every combination has a defined mode.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for externality in EXTERNALITIES {
            for risk_tier in RISK_TIERS {
                for cost_class in COST_CLASSES {
                    if !self.entries.contains_key(&(externality, risk_tier, cost_class)) {
                        return Err(PolicyError::Missing {
                            externality,
                            risk_tier,
                            cost_class,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// All defined rows, ordered, for display.
    pub fn rows(&self) -> Vec<(Externality, RiskTier, CostClass, ApprovalMode)> {
        let mut rows = Vec::with_capacity(self.entries.len());
        for externality in EXTERNALITIES {
            for risk_tier in RISK_TIERS {
                for cost_class in COST_CLASSES {
                    if let Some(mode) = self.entries.get(&(externality, risk_tier, cost_class)) {
                        rows.push((externality, risk_tier, cost_class, mode.clone()));
                    }
                }
            }
        }
        rows
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}
