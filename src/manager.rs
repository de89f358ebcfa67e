//! Structural stack operations.
//!
//! The [`StackManager`] turns plan selections into stored stacks and keeps
//! their edges current as plans are added or removed. Every change reloads
//! references and rebuilds the graph from scratch.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::plan::{LoadError, Plan, PlanLoader};
use crate::core::stack::{Stack, StackPlan};
use crate::core::types::{PlanId, StackId};
use crate::storage::{Storage, StorageError};

/// Errors from stack management.
#[derive(Debug, Error)]
pub enum StackError {
    /// None of the requested plans could be loaded.
    #[error("no valid plans for stack '{0}'")]
    NoValidPlans(StackId),

    /// A referenced plan does not exist.
    #[error("plan '{0}' not found")]
    PlanNotFound(PlanId),

    /// The plan loader failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Options for [`StackManager::create_stack`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Pull in every transitively referenced plan.
    pub include_references: bool,
}

impl CreateOptions {
    /// Follow references transitively.
    pub fn with_references() -> Self {
        Self {
            include_references: true,
        }
    }
}

/// Creates and mutates stacks.
pub struct StackManager {
    storage: Arc<dyn Storage>,
    loader: Arc<dyn PlanLoader>,
}

impl StackManager {
    /// Create a manager over `storage` and `loader`.
    pub fn new(storage: Arc<dyn Storage>, loader: Arc<dyn PlanLoader>) -> Self {
        Self { storage, loader }
    }

    /// Create a stack named `name` from `selection`.
    ///
    /// Selected ids the loader does not know are dropped with a warning.
    pub async fn create_stack(
        &self,
        name: impl Into<StackId>,
        selection: &[PlanId],
        options: CreateOptions,
    ) -> Result<Stack, StackError> {
        let name = name.into();
        let mut seen: HashSet<PlanId> = HashSet::new();
        let mut loaded: Vec<Plan> = Vec::new();

        for id in selection {
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.loader.load(id)? {
                Some(plan) => loaded.push(plan),
                None => warn!(stack = %name, plan = %id, "selected plan not found, dropping"),
            }
        }

        if options.include_references {
            self.load_closure(&mut loaded, &mut seen)?;
        }

        if loaded.is_empty() {
            return Err(StackError::NoValidPlans(name));
        }

        let stack = Stack::new(
            name,
            loaded
                .into_iter()
                .map(|plan| (plan.id, plan.references))
                .collect(),
        );
        self.storage.save_stack(stack.clone()).await?;

        info!(
            stack = %stack.id,
            plans = stack.len(),
            roots = stack.root_ids.len(),
            "created stack"
        );
        Ok(stack)
    }

    /// Breadth-first over references; each level is loaded in ascending id order.
    fn load_closure(
        &self,
        loaded: &mut Vec<Plan>,
        seen: &mut HashSet<PlanId>,
    ) -> Result<(), StackError> {
        let mut frontier: BTreeSet<PlanId> = loaded
            .iter()
            .flat_map(|plan| plan.references.iter().cloned())
            .collect();

        while !frontier.is_empty() {
            let mut next = BTreeSet::new();
            for id in frontier {
                if !seen.insert(id.clone()) {
                    continue;
                }
                match self.loader.load(&id)? {
                    Some(plan) => {
                        debug!(plan = %id, "including referenced plan");
                        next.extend(
                            plan.references
                                .iter()
                                .filter(|r| !seen.contains(*r))
                                .cloned(),
                        );
                        loaded.push(plan);
                    }
                    None => debug!(plan = %id, "referenced plan not found"),
                }
            }
            frontier = next;
        }
        Ok(())
    }

    /// Add plans to a stack.
    ///
    /// Ids already in the stack are ignored; fails with `NoValidPlans` when
    /// nothing new could be loaded.
    pub async fn add_plans(&self, name: &StackId, ids: &[PlanId]) -> Result<Stack, StackError> {
        let mut stack = self.storage.get_stack(name).await?;

        let mut seen: HashSet<&PlanId> = stack.plan_ids().collect();
        let mut added: Vec<Plan> = Vec::new();
        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.loader.load(id)? {
                Some(plan) => added.push(plan),
                None => warn!(stack = %name, plan = %id, "plan not found, not adding"),
            }
        }

        if added.is_empty() {
            return Err(StackError::NoValidPlans(name.clone()));
        }

        let mut declared = self.reload(&stack.plans);
        declared.extend(added.into_iter().map(|plan| (plan.id, plan.references)));
        stack.recompute(declared);
        self.storage.update_stack(stack.clone()).await?;

        info!(stack = %name, plans = stack.len(), "added plans");
        Ok(stack)
    }

    /// Remove plans from a stack, dropping their status entries.
    ///
    /// Removing every plan fails with `NoValidPlans`.
    pub async fn remove_plans(&self, name: &StackId, ids: &[PlanId]) -> Result<Stack, StackError> {
        let mut stack = self.storage.get_stack(name).await?;

        let to_remove: HashSet<&PlanId> = ids.iter().collect();
        let (removed, kept): (Vec<StackPlan>, Vec<StackPlan>) = stack
            .plans
            .iter()
            .cloned()
            .partition(|p| to_remove.contains(&p.id));

        if removed.is_empty() {
            debug!(stack = %name, "nothing to remove");
            return Ok(stack);
        }
        if kept.is_empty() {
            return Err(StackError::NoValidPlans(name.clone()));
        }

        let declared = self.reload(&kept);
        stack.recompute(declared);
        self.storage.update_stack(stack.clone()).await?;

        let removed_ids: Vec<PlanId> = removed.into_iter().map(|p| p.id).collect();
        self.storage.remove_plan_statuses(name, &removed_ids).await?;

        info!(stack = %name, removed = removed_ids.len(), plans = stack.len(), "removed plans");
        Ok(stack)
    }

    /// Current references of `plans`, falling back to the stored edges for
    /// plans the loader cannot provide.
    fn reload(&self, plans: &[StackPlan]) -> Vec<(PlanId, Vec<PlanId>)> {
        plans
            .iter()
            .map(|stored| match self.loader.load(&stored.id) {
                Ok(Some(plan)) => (stored.id.clone(), plan.references),
                Ok(None) => {
                    debug!(plan = %stored.id, "plan no longer loadable, keeping stored edges");
                    (stored.id.clone(), stored.depends_on.clone())
                }
                Err(e) => {
                    warn!(plan = %stored.id, error = %e, "failed to reload plan, keeping stored edges");
                    (stored.id.clone(), stored.depends_on.clone())
                }
            })
            .collect()
    }

    /// Load one plan, failing if it does not exist.
    pub fn resolve_plan(&self, id: &PlanId) -> Result<Plan, StackError> {
        self.loader
            .load(id)?
            .ok_or_else(|| StackError::PlanNotFound(id.clone()))
    }

    /// Get a stack.
    pub async fn get_stack(&self, name: &StackId) -> Result<Stack, StackError> {
        Ok(self.storage.get_stack(name).await?)
    }

    /// List all stacks, oldest first.
    pub async fn list_stacks(&self) -> Result<Vec<Stack>, StackError> {
        Ok(self.storage.list_stacks().await?)
    }

    /// Delete a stack and its status.
    pub async fn delete_stack(&self, name: &StackId) -> Result<(), StackError> {
        self.storage.delete_stack(name).await?;
        info!(stack = %name, "deleted stack");
        Ok(())
    }
}
