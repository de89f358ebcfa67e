//! Deterministic topological sort.
//!
//! Kahn's algorithm with an ordered ready set: whenever several plans are
//! ready at once, the lexicographically smallest id goes first. The same
//! graph therefore always yields the same order.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use super::cycle::find_cycle;
use super::graph::{DependencyGraph, GraphError};
use super::types::PlanId;

/// Result of sorting a graph.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortResult {
    /// Execution order; empty when a cycle exists.
    pub order: Vec<PlanId>,
    /// Whether a cycle prevented sorting.
    pub has_cycle: bool,
    /// Closed cycle path when `has_cycle` is set.
    pub cycle_nodes: Vec<PlanId>,
}

impl SortResult {
    /// Convert into the order, or a cycle error.
    pub fn into_order(self) -> Result<Vec<PlanId>, GraphError> {
        if self.has_cycle {
            Err(GraphError::CycleDetected {
                path: self.cycle_nodes,
            })
        } else {
            Ok(self.order)
        }
    }
}

/// Sort `graph` so that every plan comes after all of its dependencies.
///
/// The cycle detector runs first; on a cycle no ordering work is done.
pub fn topological_sort(graph: &DependencyGraph) -> SortResult {
    if let Some(cycle) = find_cycle(graph) {
        debug!(cycle = %cycle, "refusing to sort cyclic graph");
        return SortResult {
            order: Vec::new(),
            has_cycle: true,
            cycle_nodes: cycle.into_path(),
        };
    }

    let mut in_degree: HashMap<&PlanId, usize> = graph
        .nodes()
        .map(|node| (&node.id, node.depends_on.len()))
        .collect();

    let mut ready: BTreeSet<&PlanId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(graph.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.clone());

        for next in graph.dependents(id) {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    SortResult {
        order,
        has_cycle: false,
        cycle_nodes: Vec::new(),
    }
}
