//! Epic run controller.
//!
//! Drives the full control flow: graph build -> layer plan -> (per layer:
//! readiness gate -> concurrent dispatch -> state updates -> cascades) ->
//! terminal status -> snapshot -> audit -> report. Execution failures are
//! absorbed into blocked cascades; only structural errors abort the run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::agent::{AgentRegistry, RetryPolicy};
use crate::audit::{AuditAnalyzer, EpicRunReport};
use crate::core::errors::{EpicError, Result};
use crate::executor::layer_run::{run_layer, DispatchOptions, LayerResult};
use crate::graph::{EpicGraph, LayerPlan};
use crate::model::{EpicPlan, EpicRun, EpicStatus, SprintStatus};
use crate::state::{StateTracker, TransitionDetail, TransitionStore};

/// Run-level configuration.
#[derive(Debug, Clone)]
pub struct EpicConfig {
    /// Wall-clock bound for a single sprint invocation, in seconds.
    pub sprint_timeout_seconds: u64,
    /// Retry policy forwarded to the agent boundary.
    pub retry: RetryPolicy,
}

impl Default for EpicConfig {
    fn default() -> Self {
        Self {
            sprint_timeout_seconds: 3600,
            retry: RetryPolicy::default(),
        }
    }
}

impl EpicConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sprint_timeout_seconds == 0 {
            return Err(EpicError::structure("sprint_timeout_seconds must be greater than 0"));
        }
        if self.sprint_timeout_seconds > 86400 {
            return Err(EpicError::structure("sprint_timeout_seconds cannot exceed 24 hours"));
        }
        Ok(())
    }

    fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            sprint_timeout: Duration::from_secs(self.sprint_timeout_seconds),
            retry: self.retry.clone(),
        }
    }
}

pub struct EpicCoordinator {
    plan: EpicPlan,
    graph: EpicGraph,
    layer_plan: LayerPlan,
    tracker: Arc<StateTracker>,
    registry: Arc<AgentRegistry>,
    config: EpicConfig,
}

impl EpicCoordinator {
    /// Schedules a fresh run: validates the plan structurally, computes the
    /// immutable layer partition and initializes durable state.
    pub fn new(
        plan: EpicPlan,
        registry: Arc<AgentRegistry>,
        store: Arc<TransitionStore>,
        config: EpicConfig,
    ) -> Result<Self> {
        config.validate()?;
        let graph = EpicGraph::build(&plan)?;
        let layer_plan = LayerPlan::compute(&graph)?;
        let epic_id = plan.epic_id();
        let tracker = Arc::new(StateTracker::new(epic_id, &plan, graph.contracts(), store));
        Ok(Self {
            plan,
            graph,
            layer_plan,
            tracker,
            registry,
            config,
        })
    }

    /// Resumes an interrupted run from the durable transition log. Completed
    /// sprints are never re-dispatched; interrupted ones are re-armed.
    pub fn resume(
        plan: EpicPlan,
        registry: Arc<AgentRegistry>,
        store: Arc<TransitionStore>,
        config: EpicConfig,
    ) -> Result<Self> {
        config.validate()?;
        let graph = EpicGraph::build(&plan)?;
        let layer_plan = LayerPlan::compute(&graph)?;
        let epic_id = plan.epic_id();
        let tracker = Arc::new(StateTracker::resume(epic_id, &plan, graph.contracts(), store)?);
        Ok(Self {
            plan,
            graph,
            layer_plan,
            tracker,
            registry,
            config,
        })
    }

    pub fn layer_plan(&self) -> &LayerPlan {
        &self.layer_plan
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    /// Executes the epic to a terminal status and returns the run report.
    pub async fn run(self) -> Result<EpicRunReport> {
        // Fail fast if any sprint routes to an unregistered agent.
        for spec in &self.plan.sprints {
            if !spec.skip {
                self.registry.resolve(spec.agent.as_deref()).await?;
            }
        }

        let now = Utc::now();
        if self.tracker.was_resumed() {
            info!(epic_id = %self.tracker.epic_id(), "resuming epic run");
            self.tracker.record_epic_resumed(now)?;
        } else {
            info!(epic_id = %self.tracker.epic_id(), layers = self.layer_plan.layers.len(),
                  "starting epic run");
            self.tracker.record_epic_started(now)?;
        }

        self.apply_planner_skips()?;

        let options = self.config.dispatch_options();
        for (layer_index, layer) in self.layer_plan.layers.iter().enumerate() {
            if self.layer_is_settled(layer) {
                debug!(layer = layer_index, "layer already settled, skipping");
                continue;
            }

            self.tracker.record_layer_started(layer_index, Utc::now())?;
            self.promote_ready(layer)?;

            let result = run_layer(
                layer_index,
                layer,
                &self.tracker,
                &self.registry,
                &options,
            )
            .await?;
            self.apply_outcomes(&result)?;

            self.tracker.record_layer_finished(layer_index, Utc::now())?;
        }

        self.settle_leftovers()?;

        let status = self.terminal_status();
        self.tracker.record_epic_finished(status, Utc::now())?;
        info!(epic_id = %self.tracker.epic_id(), status = %status, "epic run finished");

        let run = self.build_epic_run(status);
        self.tracker.store().save_snapshot(&run)?;
        self.tracker.store().flush()?;

        let metrics = AuditAnalyzer::analyze(&run, &self.layer_plan)?;
        Ok(EpicRunReport::assemble(&run, metrics, &self.tracker.history()))
    }

    /// Planner-disabled sprints are recorded as `skipped` and their
    /// descendants blocked, before any layer is dispatched.
    fn apply_planner_skips(&self) -> Result<()> {
        for spec in &self.plan.sprints {
            if !spec.skip {
                continue;
            }
            if self.tracker.status_of(&spec.id) != Some(SprintStatus::Pending) {
                continue; // already terminal from a previous run
            }
            self.tracker.record_transition(
                &spec.id,
                SprintStatus::Skipped,
                Utc::now(),
                TransitionDetail::reason("skipped by plan"),
            )?;
            self.cascade_block(&spec.id, "was skipped by plan")?;
        }
        Ok(())
    }

    /// A sprint becomes `ready` once every upstream sprint (declared
    /// dependency or contract producer) is `completed` and every consumed
    /// contract is locked.
    fn promote_ready(&self, layer: &[String]) -> Result<()> {
        for sprint_id in layer {
            let Some(sprint) = self.tracker.sprint(sprint_id) else {
                continue;
            };
            if sprint.status != SprintStatus::Pending {
                continue;
            }

            let upstream_complete = self
                .graph
                .upstream_of(sprint_id)
                .iter()
                .all(|up| self.tracker.status_of(up) == Some(SprintStatus::Completed));
            let contracts_locked = sprint
                .consumes_contracts
                .iter()
                .all(|c| self.tracker.locks().is_locked(c));

            if upstream_complete && contracts_locked {
                self.tracker.record_transition(
                    sprint_id,
                    SprintStatus::Ready,
                    Utc::now(),
                    TransitionDetail::none(),
                )?;
            } else {
                // An unpromoted sprint here means an upstream failed without
                // its cascade reaching us, which would be a scheduler bug.
                warn!(sprint_id = %sprint_id, "sprint not promotable at its layer");
            }
        }
        Ok(())
    }

    /// Applies a layer's outcomes through the tracker and cascades failures.
    fn apply_outcomes(&self, result: &LayerResult) -> Result<()> {
        for outcome in &result.outcomes {
            if outcome.success {
                self.tracker.record_transition(
                    &outcome.sprint_id,
                    SprintStatus::Completed,
                    Utc::now(),
                    TransitionDetail::completed(outcome.actual_hours, outcome.payload.clone()),
                )?;
            } else {
                let reason = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "agent reported failure".to_string());
                self.tracker.record_transition(
                    &outcome.sprint_id,
                    SprintStatus::Failed,
                    Utc::now(),
                    TransitionDetail::reason(reason.clone()),
                )?;
                self.cascade_block(&outcome.sprint_id, &format!("failed: {}", reason))?;
            }
        }
        Ok(())
    }

    /// Blocks every non-terminal descendant of `root`, breadth-first, with a
    /// reason chain naming the root cause.
    fn cascade_block(&self, root: &str, root_description: &str) -> Result<()> {
        let mut queue: VecDeque<(String, String)> = VecDeque::new();
        for direct in self.graph.downstream_of(root) {
            queue.push_back((direct, root.to_string()));
        }
        while let Some((sprint_id, via)) = queue.pop_front() {
            let Some(status) = self.tracker.status_of(&sprint_id) else {
                continue;
            };
            if status.is_terminal() {
                continue;
            }
            let reason = if via == root {
                format!("upstream sprint '{}' {}", root, root_description)
            } else {
                format!(
                    "upstream sprint '{}' blocked (root cause: sprint '{}' {})",
                    via, root, root_description
                )
            };
            self.tracker.record_transition(
                &sprint_id,
                SprintStatus::Blocked,
                Utc::now(),
                TransitionDetail::reason(reason),
            )?;
            warn!(sprint_id = %sprint_id, root, "sprint blocked by upstream failure");
            for next in self.graph.downstream_of(&sprint_id) {
                queue.push_back((next, sprint_id.clone()));
            }
        }
        Ok(())
    }

    fn layer_is_settled(&self, layer: &[String]) -> bool {
        layer.iter().all(|id| {
            self.tracker
                .status_of(id)
                .map(|s| s.is_terminal())
                .unwrap_or(false)
        })
    }

    /// Defensive sweep: anything still non-terminal after the last layer is
    /// blocked with an explicit reason rather than left dangling.
    fn settle_leftovers(&self) -> Result<()> {
        for sprint in self.tracker.sprints_snapshot() {
            if !sprint.status.is_terminal() {
                warn!(sprint_id = %sprint.id, status = %sprint.status,
                      "sprint never resolved, blocking");
                self.tracker.record_transition(
                    &sprint.id,
                    SprintStatus::Blocked,
                    Utc::now(),
                    TransitionDetail::reason("upstream never resolved"),
                )?;
            }
        }
        Ok(())
    }

    /// `completed` when every sprint completed; `failed` when none did;
    /// otherwise `partially_blocked` whenever any sprint failed or was
    /// blocked.
    fn terminal_status(&self) -> EpicStatus {
        let sprints = self.tracker.sprints_snapshot();
        let completed = sprints
            .iter()
            .filter(|s| s.status == SprintStatus::Completed)
            .count();
        let troubled = sprints
            .iter()
            .filter(|s| matches!(s.status, SprintStatus::Failed | SprintStatus::Blocked))
            .count();

        if troubled == 0 {
            EpicStatus::Completed
        } else if completed == 0 {
            EpicStatus::Failed
        } else {
            EpicStatus::PartiallyBlocked
        }
    }

    fn build_epic_run(&self, status: EpicStatus) -> EpicRun {
        EpicRun {
            epic_id: self.tracker.epic_id().to_string(),
            name: self.tracker.epic_name().to_string(),
            sprints: self.tracker.sprints_snapshot(),
            contracts: self.graph.contracts().to_vec(),
            layers: self.layer_plan.layers.clone(),
            status,
            started_at: self.tracker.started_at(),
            completed_at: self.tracker.completed_at(),
        }
    }
}
