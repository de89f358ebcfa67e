//! Stacks: named, persisted plan sets with resolved edges.

use std::collections::BTreeSet;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::graph::DependencyGraph;
use super::time;
use super::types::{PlanId, StackId};

/// A plan's entry in a stack: its id and its intra-stack dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackPlan {
    /// Plan identifier.
    pub id: PlanId,
    /// Dependencies restricted to plans in the same stack.
    #[serde(default)]
    pub depends_on: Vec<PlanId>,
}

/// A named collection of plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stack {
    /// Stack name.
    pub id: StackId,
    /// Plan descriptors in selection order.
    pub plans: Vec<StackPlan>,
    /// Plans with no intra-stack dependency, in selection order.
    pub root_ids: Vec<PlanId>,
    /// When the stack was created.
    #[serde(with = "time::millis")]
    pub created_at: SystemTime,
    /// When the plan set last changed.
    #[serde(with = "time::millis")]
    pub updated_at: SystemTime,
}

impl Stack {
    /// Create a stack from `(id, references)` pairs.
    ///
    /// References are resolved against the declared ids; anything else is
    /// dropped.
    pub fn new(id: impl Into<StackId>, declared: Vec<(PlanId, Vec<PlanId>)>) -> Self {
        let now = SystemTime::now();
        let mut stack = Self {
            id: id.into(),
            plans: Vec::new(),
            root_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        stack.resolve(declared);
        stack
    }

    /// Replace the plan set and recompute edges and roots from scratch.
    pub fn recompute(&mut self, declared: Vec<(PlanId, Vec<PlanId>)>) {
        self.resolve(declared);
        self.updated_at = SystemTime::now();
    }

    fn resolve(&mut self, declared: Vec<(PlanId, Vec<PlanId>)>) {
        let available: BTreeSet<PlanId> = declared.iter().map(|(id, _)| id.clone()).collect();
        let order: Vec<PlanId> = declared.iter().map(|(id, _)| id.clone()).collect();
        let graph = DependencyGraph::build(declared, &available);

        let mut seen = BTreeSet::new();
        self.plans = order
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .map(|id| StackPlan {
                depends_on: graph.dependencies(&id).to_vec(),
                id,
            })
            .collect();
        self.root_ids = self
            .plans
            .iter()
            .filter(|p| p.depends_on.is_empty())
            .map(|p| p.id.clone())
            .collect();
    }

    /// Rebuild the dependency graph from the stored descriptors.
    pub fn graph(&self) -> DependencyGraph {
        let available: BTreeSet<PlanId> = self.plan_ids().cloned().collect();
        DependencyGraph::build(
            self.plans
                .iter()
                .map(|p| (p.id.clone(), p.depends_on.clone())),
            &available,
        )
    }

    /// Plan ids in selection order.
    pub fn plan_ids(&self) -> impl Iterator<Item = &PlanId> {
        self.plans.iter().map(|p| &p.id)
    }

    /// Get a plan descriptor.
    pub fn get(&self, id: &PlanId) -> Option<&StackPlan> {
        self.plans.iter().find(|p| &p.id == id)
    }

    /// Whether the stack contains `id`.
    pub fn contains(&self, id: &PlanId) -> bool {
        self.get(id).is_some()
    }

    /// Number of plans.
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Whether the stack has no plans.
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
