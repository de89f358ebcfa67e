//! Plans and the loader seam.
//!
//! A [`Plan`] is the unit of declared work. Plans are owned by an external
//! store; the core only reads them through a [`PlanLoader`].

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::PlanId;

/// Errors raised by a plan loader.
///
/// A missing plan is not an error; loaders return `Ok(None)` for it.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Reading the plan source failed.
    #[error("failed to read plan '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The plan source exists but could not be parsed.
    #[error("failed to parse plan '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    /// The plan parsed but is not usable.
    #[error("invalid plan: {0}")]
    Invalid(String),
}

/// A unit of declared work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: PlanId,
    /// Optional human-readable title.
    #[serde(default)]
    pub title: Option<String>,
    /// Declared references to other plans, in declaration order.
    ///
    /// References may point at plans that do not exist; the graph builder
    /// drops those.
    #[serde(default)]
    pub references: Vec<PlanId>,
    /// Opaque content handed to the worker.
    #[serde(default)]
    pub content: String,
}

impl Plan {
    /// Create a plan with no references and empty content.
    pub fn new(id: impl Into<PlanId>) -> Self {
        Self {
            id: id.into(),
            title: None,
            references: Vec::new(),
            content: String::new(),
        }
    }

    /// Set the declared references.
    pub fn with_references<I, S>(mut self, references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PlanId>,
    {
        self.references = references.into_iter().map(Into::into).collect();
        self
    }

    /// Set the content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Set the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Source of plans.
pub trait PlanLoader: Send + Sync {
    /// Load a plan by id. Returns `Ok(None)` when the plan does not exist.
    fn load(&self, id: &PlanId) -> Result<Option<Plan>, LoadError>;
}

/// Plan loader backed by an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct StaticPlanLoader {
    plans: HashMap<PlanId, Plan>,
}

impl StaticPlanLoader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a loader holding the given plans.
    pub fn from_plans(plans: impl IntoIterator<Item = Plan>) -> Self {
        let mut loader = Self::new();
        for plan in plans {
            loader.insert(plan);
        }
        loader
    }

    /// Insert or replace a plan.
    pub fn insert(&mut self, plan: Plan) {
        self.plans.insert(plan.id.clone(), plan);
    }

    /// Builder-style insert.
    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.insert(plan);
        self
    }

    /// Remove a plan, returning it if present.
    pub fn remove(&mut self, id: &PlanId) -> Option<Plan> {
        self.plans.remove(id)
    }

    /// Number of plans held.
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Whether the loader holds no plans.
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

impl PlanLoader for StaticPlanLoader {
    fn load(&self, id: &PlanId) -> Result<Option<Plan>, LoadError> {
        Ok(self.plans.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_builder() {
        let plan = Plan::new("deploy")
            .with_title("Deploy")
            .with_references(["build", "test"])
            .with_content("ship it");

        assert_eq!(plan.id.as_str(), "deploy");
        assert_eq!(plan.title.as_deref(), Some("Deploy"));
        assert_eq!(
            plan.references,
            vec![PlanId::new("build"), PlanId::new("test")]
        );
        assert_eq!(plan.content, "ship it");
    }

    #[test]
    fn test_static_loader_returns_none_for_missing_plan() {
        let loader = StaticPlanLoader::new().with_plan(Plan::new("a"));

        assert!(loader.load(&PlanId::new("a")).unwrap().is_some());
        assert!(loader.load(&PlanId::new("missing")).unwrap().is_none());
    }

    #[test]
    fn test_static_loader_replace_and_remove() {
        let mut loader = StaticPlanLoader::from_plans([Plan::new("a"), Plan::new("b")]);
        loader.insert(Plan::new("a").with_content("updated"));
        assert_eq!(loader.len(), 2);
        assert_eq!(
            loader.load(&PlanId::new("a")).unwrap().unwrap().content,
            "updated"
        );

        loader.remove(&PlanId::new("b"));
        assert_eq!(loader.len(), 1);
    }
}
