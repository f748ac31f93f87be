//! Post-run audit metrics and the epic run report.
//!
//! Runs once after the epic reaches a terminal status. Measures; never
//! decides pass/fail. The report is the sole hand-off artifact to downstream
//! reporting collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::errors::{EpicError, Result};
use crate::graph::LayerPlan;
use crate::model::{EpicRun, EpicStatus, SprintStatus};
use crate::state::TransitionEvent;

/// Balance of one layer: ratio of the mean of the other sprints' actual
/// hours to the layer's longest-running sprint. 1.0 means the layer was
/// perfectly balanced; low values mean one straggler dominated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerEfficiency {
    pub layer_index: usize,
    pub measured_sprints: usize,
    pub total_actual_hours: f64,
    pub longest_sprint: String,
    pub longest_actual_hours: f64,
    pub efficiency: f64,
}

/// A sprint that ran more than 1.5x over its estimate while also being the
/// longest-running sprint of its layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bottleneck {
    pub sprint_id: String,
    pub layer_index: usize,
    pub estimated_hours: f64,
    pub actual_hours: f64,
    pub overrun_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditMetrics {
    pub sequential_estimate_hours: f64,
    pub actual_duration_hours: f64,
    pub actual_velocity_multiplier: f64,
    pub critical_path_hours: f64,
    pub theoretical_multiplier: f64,
    pub layer_efficiency: Vec<LayerEfficiency>,
    pub bottlenecks: Vec<Bottleneck>,
}

pub struct AuditAnalyzer;

impl AuditAnalyzer {
    /// Computes audit metrics for a finished run. Requires a terminal epic
    /// status and both run timestamps.
    pub fn analyze(run: &EpicRun, layer_plan: &LayerPlan) -> Result<AuditMetrics> {
        if !run.status.is_terminal() {
            return Err(EpicError::internal(
                "audit requested before the epic run reached a terminal status",
            ));
        }
        let (started_at, completed_at) = match (run.started_at, run.completed_at) {
            (Some(s), Some(c)) => (s, c),
            _ => {
                return Err(EpicError::internal(
                    "audit requires both run timestamps",
                ))
            }
        };

        let sequential_estimate_hours: f64 =
            run.sprints.iter().map(|s| s.estimated_hours).sum();
        let actual_duration_hours =
            (completed_at - started_at).num_milliseconds() as f64 / 3_600_000.0;
        let actual_velocity_multiplier = if actual_duration_hours > 0.0 {
            sequential_estimate_hours / actual_duration_hours
        } else {
            0.0
        };

        let mut layer_efficiency = Vec::new();
        let mut bottlenecks = Vec::new();
        for (layer_index, layer) in run.layers.iter().enumerate() {
            let measured: Vec<(&str, f64, f64)> = layer
                .iter()
                .filter_map(|id| run.sprint(id))
                .filter(|s| s.status == SprintStatus::Completed)
                .filter_map(|s| s.actual_hours.map(|a| (s.id.as_str(), s.estimated_hours, a)))
                .collect();
            if measured.is_empty() {
                continue;
            }

            let total: f64 = measured.iter().map(|(_, _, a)| a).sum();
            let (longest_id, longest_estimate, longest_actual) = measured
                .iter()
                .cloned()
                .fold(measured[0], |best, item| if item.2 > best.2 { item } else { best });
            let efficiency = if measured.len() == 1 || longest_actual <= 0.0 {
                1.0
            } else {
                (total - longest_actual) / ((measured.len() - 1) as f64 * longest_actual)
            };
            layer_efficiency.push(LayerEfficiency {
                layer_index,
                measured_sprints: measured.len(),
                total_actual_hours: total,
                longest_sprint: longest_id.to_string(),
                longest_actual_hours: longest_actual,
                efficiency,
            });

            if longest_estimate > 0.0 && longest_actual > 1.5 * longest_estimate {
                bottlenecks.push(Bottleneck {
                    sprint_id: longest_id.to_string(),
                    layer_index,
                    estimated_hours: longest_estimate,
                    actual_hours: longest_actual,
                    overrun_ratio: longest_actual / longest_estimate,
                });
            }
        }

        debug!(
            sequential_estimate_hours,
            actual_duration_hours, actual_velocity_multiplier, "computed audit metrics"
        );

        Ok(AuditMetrics {
            sequential_estimate_hours,
            actual_duration_hours,
            actual_velocity_multiplier,
            critical_path_hours: layer_plan.critical_path_hours,
            theoretical_multiplier: layer_plan.theoretical_multiplier,
            layer_efficiency,
            bottlenecks,
        })
    }
}

/// One recorded status change of a sprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub status: SprintStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Per-sprint view in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SprintReport {
    pub sprint_id: String,
    pub name: String,
    pub status: SprintStatus,
    pub status_reason: Option<String>,
    pub estimated_hours: f64,
    pub actual_hours: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transitions: Vec<TransitionRecord>,
}

/// Per-layer tallies in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerReport {
    pub layer_index: usize,
    pub sprint_ids: Vec<String>,
    pub parallelizable: bool,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
}

/// The structured hand-off artifact for one epic run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicRunReport {
    pub epic_id: String,
    pub name: String,
    pub status: EpicStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sprints: Vec<SprintReport>,
    pub layers: Vec<LayerReport>,
    pub metrics: AuditMetrics,
}

impl EpicRunReport {
    pub fn assemble(
        run: &EpicRun,
        metrics: AuditMetrics,
        history: &[TransitionEvent],
    ) -> Self {
        let sprints = run
            .sprints
            .iter()
            .map(|sprint| {
                let transitions = history
                    .iter()
                    .filter(|e| e.sprint_id.as_deref() == Some(sprint.id.as_str()))
                    .filter_map(|e| match &e.event {
                        crate::state::RunEvent::SprintTransition { status, reason, .. } => {
                            Some(TransitionRecord {
                                status: *status,
                                timestamp: e.timestamp,
                                reason: reason.clone(),
                            })
                        }
                        _ => None,
                    })
                    .collect();
                SprintReport {
                    sprint_id: sprint.id.clone(),
                    name: sprint.name.clone(),
                    status: sprint.status,
                    status_reason: sprint.status_reason.clone(),
                    estimated_hours: sprint.estimated_hours,
                    actual_hours: sprint.actual_hours,
                    started_at: sprint.started_at,
                    completed_at: sprint.completed_at,
                    transitions,
                }
            })
            .collect();

        let layers = run
            .layers
            .iter()
            .enumerate()
            .map(|(layer_index, layer)| {
                let count = |status: SprintStatus| {
                    layer
                        .iter()
                        .filter(|id| {
                            run.sprint(id).map(|s| s.status == status).unwrap_or(false)
                        })
                        .count()
                };
                LayerReport {
                    layer_index,
                    sprint_ids: layer.clone(),
                    parallelizable: layer.len() > 1,
                    completed: count(SprintStatus::Completed),
                    failed: count(SprintStatus::Failed),
                    blocked: count(SprintStatus::Blocked),
                    skipped: count(SprintStatus::Skipped),
                }
            })
            .collect();

        Self {
            epic_id: run.epic_id.clone(),
            name: run.name.clone(),
            status: run.status,
            started_at: run.started_at,
            completed_at: run.completed_at,
            sprints,
            layers,
            metrics,
        }
    }

    /// Every sprint that did not complete, with its reason chain. Lets a
    /// reader identify the root cause without re-deriving the graph.
    pub fn unfinished(&self) -> Vec<(&str, SprintStatus, Option<&str>)> {
        self.sprints
            .iter()
            .filter(|s| s.status != SprintStatus::Completed)
            .map(|s| (s.sprint_id.as_str(), s.status, s.status_reason.as_deref()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EpicGraph;
    use crate::model::{EpicPlan, Sprint};
    use chrono::TimeZone;

    fn sprint(id: &str, estimated: f64, actual: Option<f64>, status: SprintStatus) -> Sprint {
        Sprint {
            id: id.to_string(),
            name: id.to_string(),
            estimated_hours: estimated,
            dependency_ids: vec![],
            produces_contracts: vec![],
            consumes_contracts: vec![],
            agent: None,
            status,
            status_reason: None,
            started_at: None,
            completed_at: None,
            actual_hours: actual,
        }
    }

    fn layer_plan_for(yaml: &str) -> LayerPlan {
        let plan = EpicPlan::from_yaml_str(yaml).unwrap();
        let graph = EpicGraph::build(&plan).unwrap();
        LayerPlan::compute(&graph).unwrap()
    }

    #[test]
    fn test_velocity_multiplier_is_exact() {
        let layer_plan = layer_plan_for(
            r#"
name: x
sprints:
  - id: s1
    estimated_hours: 3.0
  - id: s2
    estimated_hours: 5.0
  - id: s3
    estimated_hours: 1.0
    dependencies: [s1, s2]
"#,
        );
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let completed = Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 0).unwrap(); // 6h
        let run = EpicRun {
            epic_id: "e1".to_string(),
            name: "x".to_string(),
            sprints: vec![
                sprint("s1", 3.0, Some(3.0), SprintStatus::Completed),
                sprint("s2", 5.0, Some(5.0), SprintStatus::Completed),
                sprint("s3", 1.0, Some(1.0), SprintStatus::Completed),
            ],
            contracts: vec![],
            layers: vec![
                vec!["s1".to_string(), "s2".to_string()],
                vec!["s3".to_string()],
            ],
            status: EpicStatus::Completed,
            started_at: Some(started),
            completed_at: Some(completed),
        };

        let metrics = AuditAnalyzer::analyze(&run, &layer_plan).unwrap();
        assert!((metrics.sequential_estimate_hours - 9.0).abs() < 1e-9);
        assert!((metrics.actual_duration_hours - 6.0).abs() < 1e-9);
        // velocity = sequential estimate / actual duration, exactly
        assert!(
            (metrics.actual_velocity_multiplier
                - metrics.sequential_estimate_hours / metrics.actual_duration_hours)
                .abs()
                < 1e-9
        );
        // actual parallelism cannot exceed theoretical
        assert!(metrics.actual_velocity_multiplier <= metrics.theoretical_multiplier + 1e-9);
    }

    #[test]
    fn test_layer_efficiency_straggler() {
        // S1 took 3h, S2 took 5h: S1 finished early and waited, 3/5 = 0.6.
        let layer_plan = layer_plan_for(
            r#"
name: x
sprints:
  - id: s1
    estimated_hours: 3.0
  - id: s2
    estimated_hours: 5.0
"#,
        );
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let completed = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap();
        let run = EpicRun {
            epic_id: "e1".to_string(),
            name: "x".to_string(),
            sprints: vec![
                sprint("s1", 3.0, Some(3.0), SprintStatus::Completed),
                sprint("s2", 5.0, Some(5.0), SprintStatus::Completed),
            ],
            contracts: vec![],
            layers: vec![vec!["s1".to_string(), "s2".to_string()]],
            status: EpicStatus::Completed,
            started_at: Some(started),
            completed_at: Some(completed),
        };

        let metrics = AuditAnalyzer::analyze(&run, &layer_plan).unwrap();
        assert_eq!(metrics.layer_efficiency.len(), 1);
        let layer = &metrics.layer_efficiency[0];
        assert_eq!(layer.longest_sprint, "s2");
        assert!((layer.efficiency - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_bottleneck_detection() {
        // s2 is the longest in its layer and overran its estimate by >1.5x;
        // s1 overran too but was not the longest, so it is not a bottleneck.
        let layer_plan = layer_plan_for(
            r#"
name: x
sprints:
  - id: s1
    estimated_hours: 1.0
  - id: s2
    estimated_hours: 2.0
"#,
        );
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let completed = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap();
        let run = EpicRun {
            epic_id: "e1".to_string(),
            name: "x".to_string(),
            sprints: vec![
                sprint("s1", 1.0, Some(2.0), SprintStatus::Completed),
                sprint("s2", 2.0, Some(4.0), SprintStatus::Completed),
            ],
            contracts: vec![],
            layers: vec![vec!["s1".to_string(), "s2".to_string()]],
            status: EpicStatus::Completed,
            started_at: Some(started),
            completed_at: Some(completed),
        };

        let metrics = AuditAnalyzer::analyze(&run, &layer_plan).unwrap();
        assert_eq!(metrics.bottlenecks.len(), 1);
        assert_eq!(metrics.bottlenecks[0].sprint_id, "s2");
        assert!((metrics.bottlenecks[0].overrun_ratio - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_audit_refuses_in_progress_run() {
        let layer_plan = layer_plan_for(
            "name: x\nsprints:\n  - id: s1\n    estimated_hours: 1.0\n",
        );
        let run = EpicRun {
            epic_id: "e1".to_string(),
            name: "x".to_string(),
            sprints: vec![sprint("s1", 1.0, None, SprintStatus::Running)],
            contracts: vec![],
            layers: vec![vec!["s1".to_string()]],
            status: EpicStatus::InProgress,
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        assert!(AuditAnalyzer::analyze(&run, &layer_plan).is_err());
    }
}
