//! Poolkeeper testing utilities
//!
//! Mock collaborators for exercising the pool without a real classifier or
//! real lifecycle actions:
//!
//! - [`ScriptedClassifier`]: replays queued scores, then a fallback
//! - [`RecordingAction`], [`FailingAction`], [`GatedAction`]: lifecycle
//!   actions that log, fail, or block until released
//! - [`init_tracing`]: installs a `RUST_LOG`-driven subscriber once

pub mod actions;
pub mod classifier;

pub use actions::{ActionCall, ActionLog, FailingAction, GatedAction, RecordingAction};
pub use classifier::ScriptedClassifier;

use tracing_subscriber::EnvFilter;

/// Install a test subscriber. Safe to call from every test.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("poolkeeper=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
