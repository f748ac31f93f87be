//! Core data model: sprints, contracts, layers and the epic run aggregate.

pub mod plan;

pub use plan::{ContractSpec, EpicPlan, SprintSpec};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a single sprint.
///
/// A sprint starts `Pending`, becomes `Ready` once every dependency is
/// `Completed` and every consumed contract is locked, and is driven
/// `Ready -> Running -> (Completed | Failed)` by the executor. A sprint whose
/// upstream never resolves transitions directly to `Blocked` and is never
/// dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Blocked,
    Failed,
    Skipped,
}

impl SprintStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SprintStatus::Completed
                | SprintStatus::Failed
                | SprintStatus::Blocked
                | SprintStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SprintStatus::Pending => "pending",
            SprintStatus::Ready => "ready",
            SprintStatus::Running => "running",
            SprintStatus::Completed => "completed",
            SprintStatus::Blocked => "blocked",
            SprintStatus::Failed => "failed",
            SprintStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for SprintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sprint: the smallest independently-dispatchable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sprint {
    pub id: String,
    pub name: String,
    pub estimated_hours: f64,
    pub dependency_ids: Vec<String>,
    pub produces_contracts: Vec<String>,
    pub consumes_contracts: Vec<String>,
    /// Execution agent this sprint routes to; `None` uses the registry default.
    pub agent: Option<String>,
    pub status: SprintStatus,
    /// Human-readable reason chain for non-completed terminal states.
    pub status_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub actual_hours: Option<f64>,
}

impl Sprint {
    pub fn from_spec(spec: &SprintSpec) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone().unwrap_or_else(|| spec.id.clone()),
            estimated_hours: spec.estimated_hours,
            dependency_ids: spec.dependencies.clone(),
            produces_contracts: spec.produces.clone(),
            consumes_contracts: spec.consumes.clone(),
            agent: spec.agent.clone(),
            status: SprintStatus::Pending,
            status_reason: None,
            started_at: None,
            completed_at: None,
            actual_hours: None,
        }
    }
}

/// A named interface artifact with exactly one producer sprint and
/// zero-or-more consumer sprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub name: String,
    pub producer: String,
    pub consumers: Vec<String>,
}

/// Terminal status of an epic run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    InProgress,
    Completed,
    PartiallyBlocked,
    Failed,
}

impl EpicStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EpicStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EpicStatus::InProgress => "in_progress",
            EpicStatus::Completed => "completed",
            EpicStatus::PartiallyBlocked => "partially_blocked",
            EpicStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EpicStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level aggregate describing one scheduled epic run.
///
/// Layers are computed once before execution and immutable for the lifetime
/// of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicRun {
    pub epic_id: String,
    pub name: String,
    pub sprints: Vec<Sprint>,
    pub contracts: Vec<Contract>,
    pub layers: Vec<Vec<String>>,
    pub status: EpicStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EpicRun {
    pub fn sprint(&self, id: &str) -> Option<&Sprint> {
        self.sprints.iter().find(|s| s.id == id)
    }

    /// A layer is parallelizable when it holds more than one sprint.
    pub fn is_parallelizable(&self, layer_index: usize) -> bool {
        self.layers
            .get(layer_index)
            .map(|l| l.len() > 1)
            .unwrap_or(false)
    }
}
