//! Dependency graph construction and structural validation.
//!
//! Sprint-to-sprint dependency edges and contract producer/consumer edges are
//! folded into a single petgraph `DiGraph`: a consumer of contract C carries
//! an implicit edge from C's producer. All structural errors surface here,
//! before anything is dispatched.

use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::errors::{EpicError, Result};
use crate::model::{Contract, EpicPlan};

/// The validated dependency DAG for one epic.
#[derive(Debug)]
pub struct EpicGraph {
    dag: DiGraph<String, ()>,
    node_indices: HashMap<String, NodeIndex>,
    /// Sprint ids in plan declaration order.
    order: Vec<String>,
    estimates: HashMap<String, f64>,
    contracts: Vec<Contract>,
}

impl EpicGraph {
    /// Builds and validates the DAG from a parsed plan. Fails fast with a
    /// structural error on dangling references, contract producer violations
    /// and cycles; none of these are retryable.
    pub fn build(plan: &EpicPlan) -> Result<Self> {
        let mut dag = DiGraph::<String, ()>::new();
        let mut node_indices = HashMap::new();
        let mut order = Vec::with_capacity(plan.sprints.len());
        let mut estimates = HashMap::new();

        for sprint in &plan.sprints {
            let idx = dag.add_node(sprint.id.clone());
            node_indices.insert(sprint.id.clone(), idx);
            order.push(sprint.id.clone());
            estimates.insert(sprint.id.clone(), sprint.estimated_hours);
        }

        validate_dependency_references(plan, &node_indices)?;
        let contracts = derive_contracts(plan)?;

        for sprint in &plan.sprints {
            let dependent = node_indices[&sprint.id];
            for dependency_id in &sprint.dependencies {
                let dependency = node_indices[dependency_id];
                dag.update_edge(dependency, dependent, ());
            }
        }

        // Contract edges behave identically to declared dependency edges.
        for contract in &contracts {
            let producer = node_indices[&contract.producer];
            for consumer_id in &contract.consumers {
                let consumer = node_indices[consumer_id];
                if producer == consumer {
                    return Err(EpicError::structure_sprint(
                        format!(
                            "sprint '{}' both produces and consumes contract '{}'",
                            consumer_id, contract.name
                        ),
                        consumer_id.clone(),
                    ));
                }
                dag.update_edge(producer, consumer, ());
            }
        }

        if is_cyclic_directed(&dag) {
            let path = find_cycle_path(&dag, &order, &node_indices);
            return Err(EpicError::cycle(path));
        }

        Ok(Self {
            dag,
            node_indices,
            order,
            estimates,
            contracts,
        })
    }

    pub fn dag(&self) -> &DiGraph<String, ()> {
        &self.dag
    }

    pub fn node_index(&self, sprint_id: &str) -> Option<NodeIndex> {
        self.node_indices.get(sprint_id).copied()
    }

    /// Sprint ids in plan declaration order.
    pub fn sprint_order(&self) -> &[String] {
        &self.order
    }

    pub fn estimated_hours(&self, sprint_id: &str) -> f64 {
        self.estimates.get(sprint_id).copied().unwrap_or(0.0)
    }

    pub fn contracts(&self) -> &[Contract] {
        &self.contracts
    }

    /// Direct upstream sprints (declared dependencies plus contract producers).
    pub fn upstream_of(&self, sprint_id: &str) -> Vec<String> {
        let Some(idx) = self.node_index(sprint_id) else {
            return Vec::new();
        };
        self.dag
            .neighbors_directed(idx, Direction::Incoming)
            .map(|n| self.dag[n].clone())
            .collect()
    }

    /// Direct downstream sprints (dependents plus contract consumers).
    pub fn downstream_of(&self, sprint_id: &str) -> Vec<String> {
        let Some(idx) = self.node_index(sprint_id) else {
            return Vec::new();
        };
        self.dag
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.dag[n].clone())
            .collect()
    }

    /// Every sprint reachable from `sprint_id` via dependency or contract
    /// edges, in breadth-first order. Used for cascade blocking.
    pub fn descendants_of(&self, sprint_id: &str) -> Vec<String> {
        let Some(start) = self.node_index(sprint_id) else {
            return Vec::new();
        };
        let mut visited = HashSet::new();
        let mut queue = std::collections::VecDeque::new();
        let mut result = Vec::new();
        queue.push_back(start);
        visited.insert(start);
        while let Some(idx) = queue.pop_front() {
            for next in self.dag.neighbors_directed(idx, Direction::Outgoing) {
                if visited.insert(next) {
                    result.push(self.dag[next].clone());
                    queue.push_back(next);
                }
            }
        }
        result
    }
}

/// Validates that every declared dependency references an existing sprint.
fn validate_dependency_references(
    plan: &EpicPlan,
    node_indices: &HashMap<String, NodeIndex>,
) -> Result<()> {
    for sprint in &plan.sprints {
        for dependency_id in &sprint.dependencies {
            if !node_indices.contains_key(dependency_id) {
                return Err(EpicError::structure_sprint(
                    format!(
                        "dependency '{}' of sprint '{}' does not exist",
                        dependency_id, sprint.id
                    ),
                    sprint.id.clone(),
                ));
            }
        }
    }
    Ok(())
}

/// Folds per-sprint `produces`/`consumes` declarations into `Contract`
/// records, enforcing the exactly-one-producer invariant.
fn derive_contracts(plan: &EpicPlan) -> Result<Vec<Contract>> {
    let mut producers: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut names: Vec<&str> = Vec::new();

    for sprint in &plan.sprints {
        for contract in &sprint.produces {
            let entry = producers.entry(contract.as_str()).or_default();
            if entry.is_empty() && !consumers.contains_key(contract.as_str()) {
                names.push(contract.as_str());
            }
            entry.push(sprint.id.as_str());
        }
        for contract in &sprint.consumes {
            if !producers.contains_key(contract.as_str())
                && !consumers.contains_key(contract.as_str())
            {
                names.push(contract.as_str());
            }
            consumers.entry(contract.as_str()).or_default().push(sprint.id.as_str());
        }
    }
    for declared in &plan.contracts {
        if !producers.contains_key(declared.name.as_str())
            && !consumers.contains_key(declared.name.as_str())
        {
            names.push(declared.name.as_str());
        }
    }

    let mut contracts = Vec::new();
    for name in names {
        let produced_by = producers.get(name).cloned().unwrap_or_default();
        match produced_by.len() {
            0 => {
                return Err(EpicError::structure_contract(
                    format!("contract '{}' has no producer among the sprint set", name),
                    name,
                ));
            }
            1 => {}
            _ => {
                return Err(EpicError::structure_contract(
                    format!(
                        "contract '{}' has multiple producers: {}",
                        name,
                        produced_by.join(", ")
                    ),
                    name,
                ));
            }
        }
        contracts.push(Contract {
            name: name.to_string(),
            producer: produced_by[0].to_string(),
            consumers: consumers
                .get(name)
                .map(|c| c.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
        });
    }
    Ok(contracts)
}

/// Extracts one offending cycle path for the diagnostic, via depth-first
/// traversal with an explicit recursion stack. A node revisited while still
/// on the stack closes the cycle.
fn find_cycle_path(
    dag: &DiGraph<String, ()>,
    order: &[String],
    node_indices: &HashMap<String, NodeIndex>,
) -> Vec<String> {
    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut on_stack: HashSet<NodeIndex> = HashSet::new();
    let mut stack: Vec<NodeIndex> = Vec::new();

    fn dfs(
        dag: &DiGraph<String, ()>,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        visited.insert(node);
        on_stack.insert(node);
        stack.push(node);
        for next in dag.neighbors_directed(node, Direction::Outgoing) {
            if !visited.contains(&next) {
                if let Some(cycle) = dfs(dag, next, visited, on_stack, stack) {
                    return Some(cycle);
                }
            } else if on_stack.contains(&next) {
                let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<NodeIndex> = stack[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
        }
        stack.pop();
        on_stack.remove(&node);
        None
    }

    for id in order {
        let idx = node_indices[id];
        if !visited.contains(&idx) {
            if let Some(cycle) = dfs(dag, idx, &mut visited, &mut on_stack, &mut stack) {
                return cycle.into_iter().map(|n| dag[n].clone()).collect();
            }
        }
    }
    Vec::new()
}
