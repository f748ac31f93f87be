//! Topological leveling of the epic DAG into execution layers.
//!
//! Layer 0 holds every sprint with no incoming edges; layer N holds every
//! sprint whose incoming edges all originate in layers 0..N-1. Within a
//! layer, order is plan declaration order; within-layer order has no
//! scheduling significance since the whole layer runs concurrently.

use std::collections::HashMap;

use petgraph::visit::Topo;
use petgraph::Direction;
use tracing::debug;

use crate::core::errors::{EpicError, Result};
use crate::graph::build::EpicGraph;

/// The immutable layer partition plus the pre-run parallelism forecast.
#[derive(Debug, Clone)]
pub struct LayerPlan {
    pub layers: Vec<Vec<String>>,
    /// Longest dependency chain by estimated hours; lower-bounds run time.
    pub critical_path_hours: f64,
    /// Sum of all sprint estimates (the sequential duration estimate).
    pub sequential_estimate_hours: f64,
    /// sequential estimate / critical path; actual parallelism cannot
    /// exceed this.
    pub theoretical_multiplier: f64,
}

impl LayerPlan {
    pub fn compute(graph: &EpicGraph) -> Result<Self> {
        let dag = graph.dag();
        let mut levels: HashMap<String, usize> = HashMap::new();
        let mut longest_to: HashMap<String, f64> = HashMap::new();

        // Topological sweep assigns each sprint the level one past its
        // deepest upstream, and accumulates the heaviest chain ending at it.
        let mut topo = Topo::new(dag);
        let mut seen = 0usize;
        while let Some(idx) = topo.next(dag) {
            seen += 1;
            let id = &dag[idx];
            let mut level = 0usize;
            let mut heaviest_upstream = 0.0f64;
            for edge_source in dag.neighbors_directed(idx, Direction::Incoming) {
                let upstream = &dag[edge_source];
                let upstream_level = levels.get(upstream).copied().unwrap_or(0);
                level = level.max(upstream_level + 1);
                let chain = longest_to.get(upstream).copied().unwrap_or(0.0);
                if chain > heaviest_upstream {
                    heaviest_upstream = chain;
                }
            }
            levels.insert(id.clone(), level);
            longest_to.insert(id.clone(), heaviest_upstream + graph.estimated_hours(id));
        }

        // A validated graph is acyclic, so the sweep must cover every sprint.
        if seen != graph.sprint_order().len() {
            return Err(EpicError::internal(format!(
                "topological sweep covered {} of {} sprints",
                seen,
                graph.sprint_order().len()
            )));
        }

        let layer_count = levels.values().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut layers: Vec<Vec<String>> = vec![Vec::new(); layer_count];
        // Bucket in declaration order for the stable within-layer tie-break.
        for id in graph.sprint_order() {
            layers[levels[id]].push(id.clone());
        }

        let sequential_estimate_hours: f64 = graph
            .sprint_order()
            .iter()
            .map(|id| graph.estimated_hours(id))
            .sum();
        let critical_path_hours = longest_to.values().copied().fold(0.0f64, f64::max);
        let theoretical_multiplier = if critical_path_hours > 0.0 {
            sequential_estimate_hours / critical_path_hours
        } else {
            1.0
        };

        debug!(
            layers = layers.len(),
            critical_path_hours, theoretical_multiplier, "computed layer plan"
        );

        Ok(Self {
            layers,
            critical_path_hours,
            sequential_estimate_hours,
            theoretical_multiplier,
        })
    }

    pub fn layer_of(&self, sprint_id: &str) -> Option<usize> {
        self.layers
            .iter()
            .position(|layer| layer.iter().any(|id| id == sprint_id))
    }

    /// A layer is parallelizable when it holds more than one sprint.
    pub fn is_parallelizable(&self, layer_index: usize) -> bool {
        self.layers
            .get(layer_index)
            .map(|l| l.len() > 1)
            .unwrap_or(false)
    }
}
