//! Plan interrupt
//!
//! Wakes a plan that is waiting out a step delay. A plan checks the cancel
//! flag and its record's status version at every step boundary; the
//! interrupt only makes that check happen early.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub(crate) struct PlanInterrupt {
    notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

impl PlanInterrupt {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake the plan.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Wake the plan so it re-checks its record.
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}
