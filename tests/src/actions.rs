use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

use poolkeeper_kernel::lifecycle::{ActionContext, ActionError, LifecycleAction};
use poolkeeper_kernel::resource::{ResourceId, ResourceStatus};

/// One observed action execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCall {
    pub label: String,
    pub resource_id: ResourceId,
    pub plan_name: String,
    pub step_index: usize,
    /// Record status when the action started
    pub status: ResourceStatus,
}

/// Execution log shared by several actions, so their relative order can be
/// asserted.
#[derive(Debug, Clone, Default)]
pub struct ActionLog {
    calls: Arc<Mutex<Vec<ActionCall>>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, label: &str, ctx: &ActionContext) {
        self.calls.lock().push(ActionCall {
            label: label.to_string(),
            resource_id: ctx.record.id.clone(),
            plan_name: ctx.plan_name.clone(),
            step_index: ctx.step_index,
            status: ctx.record.status,
        });
    }

    pub fn calls(&self) -> Vec<ActionCall> {
        self.calls.lock().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.label.clone()).collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.label == label).count()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An action that succeeds and logs each call.
#[derive(Clone)]
pub struct RecordingAction {
    label: String,
    log: ActionLog,
}

impl RecordingAction {
    pub fn new(label: impl Into<String>, log: ActionLog) -> Self {
        Self {
            label: label.into(),
            log,
        }
    }

    pub fn call_count(&self) -> usize {
        self.log.count(&self.label)
    }
}

#[async_trait]
impl LifecycleAction for RecordingAction {
    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        self.log.push(&self.label, ctx);
        Ok(())
    }
}

/// An action that logs the call and then reports a domain failure.
#[derive(Clone)]
pub struct FailingAction {
    label: String,
    reason: String,
    log: ActionLog,
}

impl FailingAction {
    pub fn new(label: impl Into<String>, reason: impl Into<String>, log: ActionLog) -> Self {
        Self {
            label: label.into(),
            reason: reason.into(),
            log,
        }
    }
}

#[async_trait]
impl LifecycleAction for FailingAction {
    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        self.log.push(&self.label, ctx);
        Err(ActionError::Domain(self.reason.clone()))
    }
}

/// An action that blocks after it starts until the test calls
/// [`open`](GatedAction::open). Lets a test change the world while an
/// action is in flight.
#[derive(Clone)]
pub struct GatedAction {
    label: String,
    log: ActionLog,
    entered: Arc<Notify>,
    permits: Arc<Semaphore>,
}

impl GatedAction {
    pub fn new(label: impl Into<String>, log: ActionLog) -> Self {
        Self {
            label: label.into(),
            log,
            entered: Arc::new(Notify::new()),
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Wait until an execution has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let one blocked (or future) execution finish.
    pub fn open(&self) {
        self.permits.add_permits(1);
    }
}

#[async_trait]
impl LifecycleAction for GatedAction {
    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        self.log.push(&self.label, ctx);
        self.entered.notify_one();
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ActionError::Internal(e.to_string()))?;
        permit.forget();
        Ok(())
    }
}

/// Assert how many times a logged action ran.
#[macro_export]
macro_rules! assert_action_ran {
    ($log:expr, $label:expr, $expected_count:expr) => {
        let count = $log.count($label);
        assert_eq!(
            count, $expected_count,
            "Expected action '{}' to run {} times, but it ran {} times",
            $label, $expected_count, count
        );
    };
}
