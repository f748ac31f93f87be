//! epicflow - a layered parallel execution scheduler.
//!
//! An epic (a large unit of work) is decomposed into sprints with declared
//! dependencies and interface contracts. The scheduler folds both into one
//! dependency DAG, levels it into execution layers, dispatches each layer's
//! sprints concurrently to pluggable execution agents, records every status
//! transition in a durable append-only log (resumable after interruption),
//! and computes post-run audit metrics: velocity multiplier, per-layer
//! efficiency and bottleneck sprints.

// Core infrastructure modules
pub mod core {
    pub mod errors;
}

pub mod agent;
pub mod audit;
pub mod contracts;
pub mod executor;
pub mod graph;
pub mod model;
pub mod state;

// Re-exports for convenience
pub use crate::core::errors::{EpicError, Result};

pub use agent::{
    AgentRegistry, AgentRequest, AgentResponse, AgentStatus, DependencyOutput, ExecutionAgent,
    RetryBackoff, RetryPolicy,
};
pub use audit::{AuditAnalyzer, AuditMetrics, Bottleneck, EpicRunReport, LayerEfficiency};
pub use contracts::{ContractLockManager, ContractState};
pub use executor::{EpicConfig, EpicCoordinator, LayerResult, SprintOutcome};
pub use graph::{EpicGraph, LayerPlan};
pub use model::{Contract, EpicPlan, EpicRun, EpicStatus, Sprint, SprintStatus};
pub use state::{StateTracker, TransitionDetail, TransitionEvent, TransitionStore};
