//! Cycle detection.
//!
//! Iterative depth-first search over `depends_on` edges. The traversal keeps
//! its own frame stack, so graph depth is bounded by memory rather than by
//! the thread's stack size.

use std::collections::HashMap;
use std::fmt;

use super::graph::DependencyGraph;
use super::types::PlanId;

/// A dependency cycle, as a closed path.
///
/// The first and last ids are the same plan. Consecutive pairs are edges
/// `(plan, dependency)` of the graph it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    path: Vec<PlanId>,
}

impl Cycle {
    /// The closed path, e.g. `[a, b, a]`.
    pub fn path(&self) -> &[PlanId] {
        &self.path
    }

    /// Consume the cycle, returning the closed path.
    pub fn into_path(self) -> Vec<PlanId> {
        self.path
    }

    /// Number of edges in the cycle; a self-reference has one.
    pub fn edge_count(&self) -> usize {
        self.path.len().saturating_sub(1)
    }

    /// Distinct plans on the cycle, in path order.
    pub fn nodes(&self) -> &[PlanId] {
        &self.path[..self.edge_count()]
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.path.iter().map(PlanId::as_str).collect();
        write!(f, "{}", names.join(" -> "))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

/// Find a cycle in `graph`.
///
/// Start nodes are tried in ascending id order and dependencies in
/// declaration order, so the reported cycle is deterministic. Every node is
/// expanded at most once.
pub fn find_cycle(graph: &DependencyGraph) -> Option<Cycle> {
    let mut marks: HashMap<&PlanId, Mark> = HashMap::with_capacity(graph.len());
    // (node, index of the next dependency to explore); doubles as the current path.
    let mut frames: Vec<(&PlanId, usize)> = Vec::new();

    for start in graph.ids() {
        if marks.contains_key(start) {
            continue;
        }
        marks.insert(start, Mark::OnPath);
        frames.push((start, 0));

        while let Some(frame) = frames.last_mut() {
            let (node, next) = *frame;
            let deps = graph.dependencies(node);

            if next >= deps.len() {
                marks.insert(node, Mark::Done);
                frames.pop();
                continue;
            }

            frame.1 += 1;
            let dep = &deps[next];
            match marks.get(dep).copied() {
                Some(Mark::OnPath) => {
                    let pos = frames.iter().position(|(n, _)| *n == dep)?;
                    let mut path: Vec<PlanId> =
                        frames[pos..].iter().map(|(n, _)| (*n).clone()).collect();
                    path.push(dep.clone());
                    return Some(Cycle { path });
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(dep, Mark::OnPath);
                    frames.push((dep, 0));
                }
            }
        }
    }

    None
}
