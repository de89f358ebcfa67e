//! Dependency graph construction.
//!
//! A [`DependencyGraph`] is a pure function of a plan set: it is rebuilt from
//! scratch whenever the set changes and never patched in place. References
//! to plans outside the set are dropped silently.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::debug;

use super::cycle::{Cycle, find_cycle};
use super::plan::Plan;
use super::topo::{SortResult, topological_sort};
use super::types::PlanId;

/// Errors that can occur when ordering a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A cycle was detected; `path` is closed (first id == last id).
    #[error("dependency cycle detected: {}", format_path(.path))]
    CycleDetected { path: Vec<PlanId> },
}

fn format_path(path: &[PlanId]) -> String {
    path.iter()
        .map(PlanId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// The plan ID.
    pub id: PlanId,
    /// Plans this one depends on, in declaration order. Only ids in the graph.
    pub depends_on: Vec<PlanId>,
    /// Plans depending on this one, ascending by id.
    pub dependents: Vec<PlanId>,
}

/// Directed graph of plan dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeMap<PlanId, GraphNode>,
}

impl DependencyGraph {
    /// Build a graph from `(id, references)` pairs.
    ///
    /// A reference survives only if it names an id in `available` that is
    /// also one of the given plans. Duplicate references collapse to the
    /// first occurrence. A repeated plan id keeps its first declaration.
    pub fn build<I>(plans: I, available: &BTreeSet<PlanId>) -> Self
    where
        I: IntoIterator<Item = (PlanId, Vec<PlanId>)>,
    {
        let declared: Vec<(PlanId, Vec<PlanId>)> = plans.into_iter().collect();
        let present: BTreeSet<&PlanId> = declared.iter().map(|(id, _)| id).collect();

        let mut nodes: BTreeMap<PlanId, GraphNode> = BTreeMap::new();
        for (id, references) in &declared {
            if nodes.contains_key(id) {
                debug!(plan = %id, "ignoring repeated plan declaration");
                continue;
            }

            let mut depends_on: Vec<PlanId> = Vec::with_capacity(references.len());
            for reference in references {
                if !available.contains(reference) || !present.contains(reference) {
                    debug!(plan = %id, reference = %reference, "dropping reference outside the plan set");
                    continue;
                }
                if !depends_on.contains(reference) {
                    depends_on.push(reference.clone());
                }
            }

            nodes.insert(
                id.clone(),
                GraphNode {
                    id: id.clone(),
                    depends_on,
                    dependents: Vec::new(),
                },
            );
        }

        // Nodes are visited in ascending order, so each dependents list ends up sorted.
        let edges: Vec<(PlanId, PlanId)> = nodes
            .values()
            .flat_map(|node| {
                node.depends_on
                    .iter()
                    .map(move |dep| (node.id.clone(), dep.clone()))
            })
            .collect();
        for (from, to) in edges {
            if let Some(target) = nodes.get_mut(&to) {
                target.dependents.push(from);
            }
        }

        Self { nodes }
    }

    /// Build a graph from full plans, using their own ids as the available set.
    pub fn from_plans(plans: &[Plan]) -> Self {
        let available: BTreeSet<PlanId> = plans.iter().map(|p| p.id.clone()).collect();
        Self::build(
            plans.iter().map(|p| (p.id.clone(), p.references.clone())),
            &available,
        )
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the graph contains `id`.
    pub fn contains(&self, id: &PlanId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Get a node by id.
    pub fn get(&self, id: &PlanId) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// Iterate nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    /// Iterate ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &PlanId> {
        self.nodes.keys()
    }

    /// Dependencies of `id`; empty for unknown ids.
    pub fn dependencies(&self, id: &PlanId) -> &[PlanId] {
        self.nodes
            .get(id)
            .map(|n| n.depends_on.as_slice())
            .unwrap_or(&[])
    }

    /// Dependents of `id`; empty for unknown ids.
    pub fn dependents(&self, id: &PlanId) -> &[PlanId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Plans with no intra-graph dependency, ascending.
    pub fn root_ids(&self) -> Vec<PlanId> {
        self.nodes
            .values()
            .filter(|n| n.depends_on.is_empty())
            .map(|n| n.id.clone())
            .collect()
    }

    /// All edges as `(plan, dependency)` pairs.
    pub fn edges(&self) -> Vec<(PlanId, PlanId)> {
        self.nodes
            .values()
            .flat_map(|n| n.depends_on.iter().map(|d| (n.id.clone(), d.clone())))
            .collect()
    }

    /// Whether `from` depends directly on `to`.
    pub fn has_edge(&self, from: &PlanId, to: &PlanId) -> bool {
        self.dependencies(from).contains(to)
    }

    /// Find a cycle, if any.
    pub fn find_cycle(&self) -> Option<Cycle> {
        find_cycle(self)
    }

    /// Deterministic topological sort.
    pub fn topological_sort(&self) -> SortResult {
        topological_sort(self)
    }

    /// Validate the graph and return its execution order.
    pub fn execution_order(&self) -> Result<Vec<PlanId>, GraphError> {
        self.topological_sort().into_order()
    }
}
