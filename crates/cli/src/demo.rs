//! Scripted end-to-end demo of the governance pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use automate_core::{ApproverRole, CostClass, Decision, Domain, Externality, OrgId, RiskTier};
use automate_exec::{
    DomainExecutor, ExecutionReport, ExecutionRequest, ExecutorRegistry, Orchestrator,
};
use automate_graph::TaskSpec;

/// Demo agent: pretends to work for a moment, honors cancellation, and
/// reports a fixed cost.
struct ScriptedAgent {
    domain: Domain,
    cost: f64,
}

#[async_trait]
impl DomainExecutor for ScriptedAgent {
    fn domain(&self) -> Domain {
        self.domain
    }

    async fn run(&self, request: ExecutionRequest) -> ExecutionReport {
        tokio::select! {
            _ = request.cancel.cancelled() => {
                ExecutionReport::success(self.cost / 2.0).with_detail("stopped at checkpoint")
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                ExecutionReport::success(self.cost)
                    .with_artifact(format!("{}-artifact-{}", self.domain, request.attempt))
            }
        }
    }
}

/// Registry with one scripted agent per domain.
pub fn demo_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(ScriptedAgent { domain: Domain::Pr, cost: 18.0 }));
    registry.register(Arc::new(ScriptedAgent { domain: Domain::Content, cost: 12.0 }));
    registry.register(Arc::new(ScriptedAgent { domain: Domain::Seo, cost: 8.0 }));
    registry
}

/// Run the scripted campaign scenario against an assembled orchestrator.
pub async fn run(orchestrator: &Orchestrator, org: OrgId) -> anyhow::Result<()> {
    let draft = TaskSpec::new(org.clone(), Domain::Content)
        .with_cost(CostClass::Llm, 12.0)
        .with_payload(json!({ "action": "draft launch blog post" }));
    let draft_id = draft.id;

    let audit = TaskSpec::new(org.clone(), Domain::Seo)
        .with_cost(CostClass::Api, 8.0)
        .with_payload(json!({ "action": "keyword audit" }));
    let audit_id = audit.id;

    // external+low classifies as a single confirmation.
    let publish = TaskSpec::new(org.clone(), Domain::Content)
        .with_externality(Externality::External)
        .with_cost(CostClass::Api, 5.0)
        .with_depends_on(vec![draft_id])
        .with_payload(json!({ "action": "publish post" }));
    let publish_id = publish.id;

    let outreach = TaskSpec::new(org.clone(), Domain::Pr)
        .with_externality(Externality::External)
        .with_risk(RiskTier::High)
        .with_cost(CostClass::Api, 18.0)
        .with_depends_on(vec![draft_id, audit_id])
        .with_priority(200)
        .with_payload(json!({ "action": "press outreach" }));
    let outreach_id = outreach.id;

    let follow_up = TaskSpec::new(org.clone(), Domain::Pr)
        .with_externality(Externality::External)
        .with_risk(RiskTier::Medium)
        .with_cost(CostClass::Api, 6.0)
        .with_depends_on(vec![outreach_id])
        .with_payload(json!({ "action": "follow-up emails" }));
    let follow_up_id = follow_up.id;

    let ids = orchestrator.submit(vec![draft, audit, publish, outreach, follow_up])?;
    println!("Submitted {} tasks", ids.len());

    orchestrator.run_until_idle().await;

    // Internal spend tasks classified as Confirm: sign them off.
    for request in orchestrator.pending_approvals(ApproverRole::DomainLead) {
        println!("Confirming task {} as domain lead", request.task_id);
        orchestrator.decide(
            request.task_id,
            ApproverRole::DomainLead,
            "demo-lead",
            Decision::Approve,
            Some("demo sign-off".to_string()),
        )?;
    }
    orchestrator.run_until_idle().await;

    // Publish needs its own confirmation once the draft is done.
    if orchestrator.pending_approvals(ApproverRole::DomainLead).iter().any(|r| r.task_id == publish_id) {
        println!("Confirming publish task as domain lead");
        orchestrator.decide(
            publish_id,
            ApproverRole::DomainLead,
            "demo-lead",
            Decision::Approve,
            None,
        )?;
    }

    // The external+high outreach runs the full chain; compliance says no.
    println!("Walking the approval chain for press outreach {outreach_id}");
    orchestrator.decide(
        outreach_id,
        ApproverRole::Requester,
        "demo-requester",
        Decision::Approve,
        None,
    )?;
    orchestrator.decide(
        outreach_id,
        ApproverRole::DomainLead,
        "demo-lead",
        Decision::Approve,
        None,
    )?;
    orchestrator.decide(
        outreach_id,
        ApproverRole::Compliance,
        "demo-compliance",
        Decision::Reject,
        Some("embargo until next quarter".to_string()),
    )?;
    orchestrator.run_until_idle().await;

    println!();
    println!("Final task states:");
    let mut snapshot = orchestrator.snapshot();
    snapshot.tasks.sort_by_key(|t| t.created_at);
    for task in &snapshot.tasks {
        println!(
            "  {} | {:9} | {:18} | attempts {} | est {:6.2}",
            task.id, task.domain.to_string(), task.state.to_string(), task.attempts, task.estimated_cost,
        );
    }

    if let Some(usage) = orchestrator.usage(&org) {
        println!();
        println!(
            "Budget: spent {:.2} / {:.2}, reserved {:.2}, degradation {}",
            usage.spent, usage.allocated, usage.reserved, usage.level,
        );
    }

    println!();
    println!("Why did the press outreach not run?");
    for event in orchestrator.history(outreach_id) {
        println!(
            "  #{} {} -> {} [{}] {}",
            event.seq, event.from_state, event.to_state, event.actor, event.reason,
        );
    }
    println!();
    println!("Cascaded follow-up {}:", follow_up_id);
    for event in orchestrator.history(follow_up_id) {
        println!(
            "  #{} {} -> {} [{}] {}",
            event.seq, event.from_state, event.to_state, event.actor, event.reason,
        );
    }

    Ok(())
}
