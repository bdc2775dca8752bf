//! Risk gate configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use poolkeeper_kernel::error::KernelError;
use poolkeeper_kernel::resource::ResourceStatus;

use super::GateDecision;

/// Thresholds and window sizing for [`RiskGate`](super::RiskGate)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskGateConfig {
    /// Score at or above which ACTIVE/FLAGGED records are suspended
    pub high_threshold: f64,
    /// Score at or above which ACTIVE records are flagged
    pub low_threshold: f64,
    /// Most recent actions kept per record
    pub window_size: usize,
    /// Period of the background risk monitor
    pub evaluation_interval_ms: u64,
}

impl Default for RiskGateConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.9,
            low_threshold: 0.6,
            window_size: 50,
            evaluation_interval_ms: 60_000,
        }
    }
}

impl RiskGateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(mut self, low: f64, high: f64) -> Self {
        self.low_threshold = low;
        self.high_threshold = high;
        self
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_evaluation_interval(mut self, interval: Duration) -> Self {
        self.evaluation_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_unit(self.low_threshold) || !in_unit(self.high_threshold) {
            return Err(KernelError::InvalidConfig(format!(
                "risk thresholds must lie in [0, 1] (low={}, high={})",
                self.low_threshold, self.high_threshold
            )));
        }
        if self.low_threshold > self.high_threshold {
            return Err(KernelError::InvalidConfig(format!(
                "risk.low_threshold ({}) exceeds risk.high_threshold ({})",
                self.low_threshold, self.high_threshold
            )));
        }
        if self.window_size == 0 {
            return Err(KernelError::InvalidConfig(
                "risk.window_size must be at least 1".to_string(),
            ));
        }
        if self.evaluation_interval_ms == 0 {
            return Err(KernelError::InvalidConfig(
                "risk.evaluation_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Map a score to the gate's decision for a record in `status`.
    ///
    /// Only ACTIVE and FLAGGED records are gated. FLAGGED has no edge back to
    /// ACTIVE, so a low score on a flagged record clears nothing.
    pub fn decide(&self, status: ResourceStatus, score: f64) -> GateDecision {
        match status {
            ResourceStatus::Active | ResourceStatus::Flagged if score >= self.high_threshold => {
                GateDecision::Suspend
            }
            ResourceStatus::Active if score >= self.low_threshold => GateDecision::Flag,
            ResourceStatus::Active | ResourceStatus::Flagged => GateDecision::Clear,
            _ => GateDecision::NotApplicable,
        }
    }
}
