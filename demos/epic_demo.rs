//! End-to-end demo: schedule a small epic, run it against a stub agent and
//! print the audit report.
//!
//! Run with: cargo run --example epic_demo

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use epicflow::{
    AgentRegistry, AgentRequest, AgentResponse, EpicConfig, EpicCoordinator, EpicPlan,
    ExecutionAgent, TransitionStore,
};

/// Stub worker that pretends to do the sprint's work.
struct StubWorker;

#[async_trait]
impl ExecutionAgent for StubWorker {
    fn name(&self) -> String {
        "stub".to_string()
    }

    fn description(&self) -> String {
        "Echoes the work order back as a completed result".to_string()
    }

    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse> {
        info!(
            sprint = %request.sprint_id,
            deps = request.dependency_context.len(),
            "stub worker invoked"
        );
        Ok(AgentResponse::completed(
            0.1,
            Some(json!({ "echo": request.sprint_id })),
        ))
    }
}

const PLAN: &str = r#"
epic_id: demo-epic
name: Payment pipeline rework
sprints:
  - id: schema
    name: Design ledger schema
    estimated_hours: 4.0
    produces: [ledger_api]
  - id: gateway
    name: Gateway integration
    estimated_hours: 6.0
  - id: ledger
    name: Ledger writes
    estimated_hours: 3.0
    consumes: [ledger_api]
  - id: reconcile
    name: Reconciliation job
    estimated_hours: 2.0
    dependencies: [gateway, ledger]
"#;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let plan = EpicPlan::from_yaml_str(PLAN)?;
    let registry = Arc::new(AgentRegistry::new());
    registry.register_default("stub", Arc::new(StubWorker)).await?;
    let store = Arc::new(TransitionStore::temporary()?);

    let coordinator = EpicCoordinator::new(plan, registry, store, EpicConfig::default())?;
    info!(
        layers = ?coordinator.layer_plan().layers,
        theoretical_multiplier = coordinator.layer_plan().theoretical_multiplier,
        "layer plan computed"
    );

    let report = coordinator.run().await?;
    println!("epic '{}' finished: {}", report.name, report.status);
    println!(
        "sequential estimate: {:.1}h, velocity multiplier: {:.2}x",
        report.metrics.sequential_estimate_hours, report.metrics.actual_velocity_multiplier
    );
    for layer in &report.layers {
        println!(
            "layer {}: {:?} (completed: {})",
            layer.layer_index, layer.sprint_ids, layer.completed
        );
    }
    Ok(())
}
