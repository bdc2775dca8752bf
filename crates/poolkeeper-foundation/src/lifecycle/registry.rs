//! Action registry
//!
//! Explicit table from [`ActionKind`] to its handler. Plans are checked
//! against the table before they start, so a typo in an action name fails
//! fast with `UnknownAction` instead of halfway through a plan.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use poolkeeper_kernel::lifecycle::{ActionKind, LifecycleAction, TransitionPlan};

/// Registered lifecycle actions
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<ActionKind, Arc<dyn LifecycleAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, kind: impl Into<ActionKind>, action: Arc<dyn LifecycleAction>) -> Self {
        self.register(kind, action);
        self
    }

    /// Register a handler, returning the one it replaced.
    pub fn register(
        &mut self,
        kind: impl Into<ActionKind>,
        action: Arc<dyn LifecycleAction>,
    ) -> Option<Arc<dyn LifecycleAction>> {
        self.actions.insert(kind.into(), action)
    }

    pub fn get(&self, kind: &ActionKind) -> Option<Arc<dyn LifecycleAction>> {
        self.actions.get(kind).cloned()
    }

    pub fn contains(&self, kind: &ActionKind) -> bool {
        self.actions.contains_key(kind)
    }

    /// First action of `plan` with no handler.
    pub fn first_missing(&self, plan: &TransitionPlan) -> Option<ActionKind> {
        plan.steps
            .iter()
            .find(|step| !self.contains(&step.action))
            .map(|step| step.action.clone())
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<_> = self.actions.keys().cloned().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.kinds())
            .finish()
    }
}
