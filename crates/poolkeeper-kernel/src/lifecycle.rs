//! Lifecycle plan contracts
//!
//! A [`TransitionPlan`] is an ordered list of `(delay, action)` steps attached
//! to one lifecycle state. Actions are identified by [`ActionKind`] and
//! resolved through an explicit registry in foundation, never by reflective
//! name lookup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::resource::{ResourceRecord, ResourceStatus};

/// Kind of lifecycle action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Verify,
    Warmup,
    Heartbeat,
    /// Deployment-specific action registered under a free-form name
    Named(String),
}

impl ActionKind {
    pub fn named(name: impl Into<String>) -> Self {
        ActionKind::Named(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Verify => "verify",
            ActionKind::Warmup => "warmup",
            ActionKind::Heartbeat => "heartbeat",
            ActionKind::Named(name) => name,
        }
    }
}

impl From<&str> for ActionKind {
    fn from(name: &str) -> Self {
        match name {
            "verify" => ActionKind::Verify,
            "warmup" => ActionKind::Warmup,
            "heartbeat" => ActionKind::Heartbeat,
            other => ActionKind::Named(other.to_string()),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One plan step: wait `delay_ms`, then run `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub delay_ms: u64,
    pub action: ActionKind,
}

impl PlanStep {
    pub fn new(delay: Duration, action: impl Into<ActionKind>) -> Self {
        Self {
            delay_ms: delay.as_millis().try_into().unwrap_or(u64::MAX),
            action: action.into(),
        }
    }

    pub fn immediate(action: impl Into<ActionKind>) -> Self {
        Self::new(Duration::ZERO, action)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// What a plan is for. Determines how failures are marked on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Warmup,
    Usage,
    Review,
}

/// Ordered, delayed action sequence for one lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPlan {
    pub name: String,
    pub kind: PlanKind,
    pub steps: Vec<PlanStep>,
    /// Status to enter when every step succeeds
    #[serde(default)]
    pub on_success: Option<ResourceStatus>,
    /// Status to enter when a step fails; `None` keeps the current status
    #[serde(default)]
    pub on_failure: Option<ResourceStatus>,
}

impl TransitionPlan {
    pub fn new(name: impl Into<String>, kind: PlanKind, steps: Vec<PlanStep>) -> Self {
        Self {
            name: name.into(),
            kind,
            steps,
            on_success: None,
            on_failure: None,
        }
    }

    /// Warmup plan: VERIFIED records become ACTIVE on success; on failure
    /// they stay VERIFIED with `warmup_failed` set.
    pub fn warmup(steps: Vec<PlanStep>) -> Self {
        Self::new("warmup", PlanKind::Warmup, steps).on_success(ResourceStatus::Active)
    }

    pub fn on_success(mut self, status: ResourceStatus) -> Self {
        self.on_success = Some(status);
        self
    }

    pub fn on_failure(mut self, status: ResourceStatus) -> Self {
        self.on_failure = Some(status);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Snapshot handed to an action.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub record: ResourceRecord,
    pub plan_name: String,
    pub step_index: usize,
}

/// Action errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ActionError {
    /// The action ran and reported a domain failure
    #[error("{0}")]
    Domain(String),
    /// The action could not run at all
    #[error("Internal action error: {0}")]
    Internal(String),
}

/// A named lifecycle action. Runs to completion or failure; it is never
/// interrupted mid-flight.
#[async_trait]
pub trait LifecycleAction: Send + Sync {
    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError>;
}

/// Why a plan stopped early without failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// The record's status changed out-of-band (risk gate or operator)
    Preempted { observed: ResourceStatus },
    /// An explicit cancel request
    Cancelled,
}

/// Result of running a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlanOutcome {
    Completed {
        final_status: ResourceStatus,
        steps_run: usize,
    },
    Failed {
        step: usize,
        action: ActionKind,
        reason: String,
    },
    /// Stopped at the boundary before `step`
    Aborted { step: usize, reason: AbortReason },
}

impl PlanOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PlanOutcome::Completed { .. })
    }
}
