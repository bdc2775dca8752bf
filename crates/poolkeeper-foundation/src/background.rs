//! Periodic background tasks
//!
//! The reclaim sweep and the risk monitor both run as a tokio task driven by
//! an interval and stopped through a oneshot channel.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to a periodic background task.
///
/// Dropping the handle stops the task at its next wake-up.
pub struct BackgroundTask {
    name: &'static str,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Run `tick` every `period` until cancelled. The first run happens one
    /// full period after spawning.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let period = period.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!(task = name, "background task stopped");
        });

        debug!(task = name, period_ms = period.as_millis() as u64, "background task started");
        Self {
            name,
            cancel_tx: Some(cancel_tx),
            task: Some(task),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Signal the task to stop without waiting for it.
    ///
    /// Returns `true` if the signal was delivered (the task was still running).
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Stop the task and wait for the in-progress tick, if any, to finish.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                if err.is_panic() {
                    tracing::error!(task = self.name, "background task panicked");
                }
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
