//! Risk gate
//!
//! Keeps a bounded, ordered window of recent actions per record and turns
//! classifier scores into gate decisions. The gate itself never changes a
//! record's status; the lifecycle engine applies its decisions.
//!
//! A classifier failure (or a score outside `[0, 1]`) yields
//! [`RiskSignal::NoSignal`]: the last known state is kept and nothing is
//! forced.

mod config;

pub use config::RiskGateConfig;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use poolkeeper_kernel::resource::{ResourceId, ResourceStatus};
use poolkeeper_kernel::risk::{ActionEvent, RiskClassifier, check_score};
use tracing::{debug, warn};

/// Outcome of one scoring attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskSignal {
    Score(f64),
    /// The classifier could not produce a usable score
    NoSignal,
}

/// What the gate wants done with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Force SUSPENDED
    Suspend,
    /// Force FLAGGED
    Flag,
    /// Scored, no transition
    Clear,
    /// Record status is not subject to gating, or there was no signal
    NotApplicable,
}

impl GateDecision {
    /// Target status of a forced transition.
    pub fn target(self) -> Option<ResourceStatus> {
        match self {
            GateDecision::Suspend => Some(ResourceStatus::Suspended),
            GateDecision::Flag => Some(ResourceStatus::Flagged),
            GateDecision::Clear | GateDecision::NotApplicable => None,
        }
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateDecision::Suspend => "suspend",
            GateDecision::Flag => "flag",
            GateDecision::Clear => "clear",
            GateDecision::NotApplicable => "not_applicable",
        };
        f.write_str(name)
    }
}

/// Whether records in `status` are subject to risk gating.
pub fn is_gated(status: ResourceStatus) -> bool {
    matches!(status, ResourceStatus::Active | ResourceStatus::Flagged)
}

#[derive(Debug, Default)]
struct RiskGateMetrics {
    evaluations: AtomicU64,
    suspended: AtomicU64,
    flagged: AtomicU64,
    no_signal: AtomicU64,
}

/// Point-in-time copy of the gate counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskGateMetricsSnapshot {
    pub evaluations: u64,
    pub suspended: u64,
    pub flagged: u64,
    pub no_signal: u64,
}

/// Classifier front-end with per-record action windows.
pub struct RiskGate {
    classifier: Arc<dyn RiskClassifier>,
    config: RiskGateConfig,
    windows: DashMap<ResourceId, VecDeque<ActionEvent>>,
    metrics: RiskGateMetrics,
}

impl RiskGate {
    pub fn new(classifier: Arc<dyn RiskClassifier>, config: RiskGateConfig) -> Self {
        Self {
            classifier,
            config,
            windows: DashMap::new(),
            metrics: RiskGateMetrics::default(),
        }
    }

    pub fn config(&self) -> &RiskGateConfig {
        &self.config
    }

    /// Append an action to its record's window, dropping the oldest entries
    /// beyond `window_size`.
    pub fn record_action(&self, event: ActionEvent) {
        let limit = self.config.window_size.max(1);
        let mut window = self.windows.entry(event.resource_id.clone()).or_default();
        window.push_back(event);
        while window.len() > limit {
            window.pop_front();
        }
    }

    /// Copy of a record's window, oldest first.
    pub fn window(&self, id: &ResourceId) -> Vec<ActionEvent> {
        self.windows
            .get(id)
            .map(|window| window.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_window(&self, id: &ResourceId) {
        self.windows.remove(id);
    }

    /// Score a record's current window. No lock is held while the classifier
    /// runs.
    pub async fn score(&self, id: &ResourceId) -> RiskSignal {
        let window = self.window(id);
        self.metrics.evaluations.fetch_add(1, Ordering::SeqCst);

        let signal = match self.classifier.score(&window).await {
            Ok(raw) => match check_score(raw) {
                Ok(score) => RiskSignal::Score(score),
                Err(err) => {
                    warn!(resource_id = %id, error = %err, "classifier returned an unusable score");
                    RiskSignal::NoSignal
                }
            },
            Err(err) => {
                warn!(resource_id = %id, error = %err, "model unavailable, keeping last known state");
                RiskSignal::NoSignal
            }
        };

        match signal {
            RiskSignal::Score(score) => {
                debug!(resource_id = %id, score, window_len = window.len(), "record scored")
            }
            RiskSignal::NoSignal => {
                self.metrics.no_signal.fetch_add(1, Ordering::SeqCst);
            }
        }
        signal
    }

    pub fn decide(&self, status: ResourceStatus, score: f64) -> GateDecision {
        self.config.decide(status, score)
    }

    /// Count a decision that was actually applied.
    pub(crate) fn note_applied(&self, decision: GateDecision) {
        match decision {
            GateDecision::Suspend => {
                self.metrics.suspended.fetch_add(1, Ordering::SeqCst);
            }
            GateDecision::Flag => {
                self.metrics.flagged.fetch_add(1, Ordering::SeqCst);
            }
            GateDecision::Clear | GateDecision::NotApplicable => {}
        }
    }

    pub fn metrics(&self) -> RiskGateMetricsSnapshot {
        RiskGateMetricsSnapshot {
            evaluations: self.metrics.evaluations.load(Ordering::SeqCst),
            suspended: self.metrics.suspended.load(Ordering::SeqCst),
            flagged: self.metrics.flagged.load(Ordering::SeqCst),
            no_signal: self.metrics.no_signal.load(Ordering::SeqCst),
        }
    }
}
