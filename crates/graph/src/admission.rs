//! Batch admission - task specs and acyclicity validation.

use std::collections::{HashMap, HashSet, VecDeque};

use automate_core::{
    CostClass, Domain, Externality, OrgId, RiskTier, Task, TaskId, TaskState, Time,
};

use crate::store::GraphError;

/// Specification for admitting a task into the graph.
///
/// The id is generated up front so a batch can reference its own members
/// in `depends_on` before submission.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Pre-generated task id
    pub id: TaskId,
    /// Owning organization
    pub org: OrgId,
    /// Owning pillar
    pub domain: Domain,
    /// Opaque payload handed to the executor
    pub payload: serde_json::Value,
    /// Dependencies within this batch or the prior graph
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
    /// Reservation amount for dispatch admission
    pub estimated_cost: f64,
}

impl TaskSpec {
    /// Create a spec with defaults: internal, low risk, no spend.
    pub fn new(org: OrgId, domain: Domain) -> Self {
        Self {
            id: TaskId::new(),
            org,
            domain,
            payload: serde_json::Value::Null,
            depends_on: Vec::new(),
            externality: Externality::Internal,
            risk_tier: RiskTier::Low,
            cost_class: CostClass::None,
            compliance_required: false,
            priority: 128,
            estimated_cost: 0.0,
        }
    }

    /// Set dependencies.
    pub fn with_depends_on(mut self, deps: Vec<TaskId>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Set the externality classification.
    pub fn with_externality(mut self, externality: Externality) -> Self {
        self.externality = externality;
        self
    }

    /// Set the risk tier.
    pub fn with_risk(mut self, risk_tier: RiskTier) -> Self {
        self.risk_tier = risk_tier;
        self
    }

    /// Set the cost class and reservation estimate.
    pub fn with_cost(mut self, cost_class: CostClass, estimated_cost: f64) -> Self {
        self.cost_class = cost_class;
        self.estimated_cost = estimated_cost;
        self
    }

    /// Mark compliance review as required.
    pub fn with_compliance_required(mut self) -> Self {
        self.compliance_required = true;
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the opaque payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub(crate) fn into_task(self, now: Time) -> Task {
        Task {
            id: self.id,
            org: self.org,
            domain: self.domain,
            payload: self.payload,
            depends_on: self.depends_on,
            externality: self.externality,
            risk_tier: self.risk_tier,
            cost_class: self.cost_class,
            compliance_required: self.compliance_required,
            priority: self.priority,
            estimated_cost: self.estimated_cost,
            state: TaskState::Pending,
            attempts: 0,
            retry_at: None,
            approval_mode: None,
            approved: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Validate a batch: every dependency must resolve to the batch or the prior
/// graph, and the batch-internal dependency edges must be acyclic.
///
/// The prior graph is already acyclic and existing tasks never gain new
/// dependencies, so a cycle can only involve batch members.
pub(crate) fn validate_batch(
    specs: &[TaskSpec],
    existing: &HashSet<TaskId>,
) -> Result<(), GraphError> {
    let batch: HashSet<TaskId> = specs.iter().map(|s| s.id).collect();

    for spec in specs {
        if existing.contains(&spec.id) {
            return Err(GraphError::DuplicateTask(spec.id));
        }
        for dep in &spec.depends_on {
            if !batch.contains(dep) && !existing.contains(dep) {
                return Err(GraphError::UnknownDependency {
                    task: spec.id,
                    dependency: *dep,
                });
            }
        }
    }

    // Kahn's algorithm over batch-internal edges.
    let mut in_degree: HashMap<TaskId, usize> = batch.iter().map(|id| (*id, 0)).collect();
    let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for spec in specs {
        for dep in &spec.depends_on {
            if batch.contains(dep) {
                *in_degree.entry(spec.id).or_insert(0) += 1;
                dependents.entry(*dep).or_default().push(spec.id);
            }
        }
    }

    let mut queue: VecDeque<TaskId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut processed = 0usize;

    while let Some(id) = queue.pop_front() {
        processed += 1;
        if let Some(next) = dependents.get(&id) {
            for dependent in next {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }
    }

    if processed < batch.len() {
        let mut members: Vec<TaskId> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id)
            .collect();
        members.sort();
        return Err(GraphError::Cycle { members });
    }

    Ok(())
}
