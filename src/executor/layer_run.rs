//! Concurrent dispatch of one execution layer.
//!
//! Every `ready` sprint in the layer is dispatched as an independent tokio
//! task; the function returns only after all dispatched invocations reach a
//! terminal state (join/barrier semantics, no partial layer advancement).
//! Siblings of a failed sprint are never hard-killed; they run to their own
//! terminal state or timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentRegistry, AgentRequest, AgentStatus, DependencyOutput, RetryPolicy};
use crate::core::errors::Result;
use crate::model::{Sprint, SprintStatus};
use crate::state::{StateTracker, TransitionDetail};

/// Per-dispatch knobs handed to the executor.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Wall-clock upper bound for a single sprint invocation.
    pub sprint_timeout: Duration,
    /// Retry policy forwarded to the agent boundary.
    pub retry: RetryPolicy,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            sprint_timeout: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Terminal outcome of one dispatched sprint.
#[derive(Debug, Clone)]
pub struct SprintOutcome {
    pub sprint_id: String,
    pub success: bool,
    pub actual_hours: Option<f64>,
    pub payload: Option<Value>,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl SprintOutcome {
    fn failed(sprint_id: String, error: String, timed_out: bool) -> Self {
        Self {
            sprint_id,
            success: false,
            actual_hours: None,
            payload: None,
            error: Some(error),
            timed_out,
        }
    }
}

/// Aggregated per-sprint outcomes for one layer. Carries no decisions; the
/// coordinator interprets it.
#[derive(Debug)]
pub struct LayerResult {
    pub layer_index: usize,
    pub outcomes: Vec<SprintOutcome>,
}

impl LayerResult {
    pub fn outcome_of(&self, sprint_id: &str) -> Option<&SprintOutcome> {
        self.outcomes.iter().find(|o| o.sprint_id == sprint_id)
    }

    pub fn dispatched(&self) -> usize {
        self.outcomes.len()
    }
}

/// Dispatches every `ready` sprint in the layer concurrently and waits for
/// all of them to resolve.
pub async fn run_layer(
    layer_index: usize,
    sprint_ids: &[String],
    tracker: &Arc<StateTracker>,
    registry: &Arc<AgentRegistry>,
    options: &DispatchOptions,
) -> Result<LayerResult> {
    let mut pending = FuturesUnordered::new();

    for sprint_id in sprint_ids {
        let Some(sprint) = tracker.sprint(sprint_id) else {
            continue;
        };
        if sprint.status != SprintStatus::Ready {
            // Blocked/skipped sprints from prior cascades are never dispatched.
            debug!(sprint_id = %sprint_id, status = %sprint.status, "skipping non-ready sprint");
            continue;
        }

        let agent = registry.resolve(sprint.agent.as_deref()).await?;
        let request = build_request(&sprint, tracker, &options.retry);
        tracker.record_transition(
            sprint_id,
            SprintStatus::Running,
            Utc::now(),
            TransitionDetail::none(),
        )?;
        info!(sprint_id = %sprint_id, layer = layer_index, agent = %agent.name(), "dispatching sprint");

        let sid = sprint_id.clone();
        let join_sid = sprint_id.clone();
        let bound = options.sprint_timeout;
        let handle = tokio::spawn(async move {
            match timeout(bound, agent.invoke(request)).await {
                Ok(Ok(response)) => match response.status {
                    AgentStatus::Completed => SprintOutcome {
                        sprint_id: sid,
                        success: true,
                        actual_hours: response.actual_hours,
                        payload: response.payload,
                        error: None,
                        timed_out: false,
                    },
                    AgentStatus::Failed => SprintOutcome::failed(
                        sid,
                        response
                            .error
                            .unwrap_or_else(|| "agent reported failure".to_string()),
                        false,
                    ),
                },
                Ok(Err(e)) => SprintOutcome::failed(sid, e.to_string(), false),
                Err(_) => SprintOutcome::failed(
                    sid,
                    format!("timeout after {}s", bound.as_secs()),
                    true,
                ),
            }
        });
        pending.push(async move { (join_sid, handle.await) });
    }

    // Barrier: every dispatched invocation must resolve before the next
    // layer is considered.
    let mut outcomes = Vec::new();
    while let Some((sprint_id, joined)) = pending.next().await {
        match joined {
            Ok(outcome) => {
                if outcome.success {
                    info!(sprint_id = %outcome.sprint_id, "sprint completed");
                } else {
                    warn!(
                        sprint_id = %outcome.sprint_id,
                        error = outcome.error.as_deref().unwrap_or(""),
                        timed_out = outcome.timed_out,
                        "sprint failed"
                    );
                }
                outcomes.push(outcome);
            }
            Err(join_error) => {
                // A panicked agent task still yields a terminal failure so
                // the barrier can close.
                error!(sprint_id = %sprint_id, error = %join_error, "sprint execution task panicked");
                outcomes.push(SprintOutcome::failed(
                    sprint_id,
                    format!("execution task panicked: {}", join_error),
                    false,
                ));
            }
        }
    }

    Ok(LayerResult {
        layer_index,
        outcomes,
    })
}

/// Builds the work order: ordered completed-dependency outputs (declared
/// dependencies first, then producers of consumed contracts) and the locked
/// contract set the agent may assume.
fn build_request(sprint: &Sprint, tracker: &Arc<StateTracker>, retry: &RetryPolicy) -> AgentRequest {
    let mut seen = HashSet::new();
    let mut dependency_context = Vec::new();
    for dep in &sprint.dependency_ids {
        if seen.insert(dep.clone()) {
            dependency_context.push(DependencyOutput {
                sprint_id: dep.clone(),
                payload: tracker.payload_of(dep),
            });
        }
    }
    for contract in &sprint.consumes_contracts {
        if let Some(producer) = tracker.locks().producer_of(contract) {
            if seen.insert(producer.to_string()) {
                dependency_context.push(DependencyOutput {
                    sprint_id: producer.to_string(),
                    payload: tracker.payload_of(producer),
                });
            }
        }
    }

    AgentRequest {
        sprint_id: sprint.id.clone(),
        dependency_context,
        locked_contracts: sprint.consumes_contracts.clone(),
        retry: retry.clone(),
    }
}
