//! Risk classifier contract.
//!
//! The classifier is an external collaborator (local model or remote
//! service). From the pool's perspective it is a pure function from an
//! ordered window of timestamped actions to a score in `[0, 1]`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::lifecycle::ActionKind;
use crate::resource::ResourceId;

/// One observed action against a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub resource_id: ResourceId,
    pub action: ActionKind,
    pub at_ms: u64,
}

impl ActionEvent {
    pub fn new(resource_id: ResourceId, action: ActionKind, at_ms: u64) -> Self {
        Self {
            resource_id,
            action,
            at_ms,
        }
    }
}

/// Classifier errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ClassifierError {
    /// The model could not produce a score. Callers treat this as "no new
    /// information", never as a zero score.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    /// The model answered with something outside `[0, 1]`
    #[error("Invalid score: {0}")]
    InvalidScore(f64),
}

/// Scores an ordered action window.
#[async_trait]
pub trait RiskClassifier: Send + Sync {
    /// Score `window` (oldest first). Must return a value in `[0, 1]`.
    async fn score(&self, window: &[ActionEvent]) -> Result<f64, ClassifierError>;
}

/// Validate a raw classifier output.
pub fn check_score(score: f64) -> Result<f64, ClassifierError> {
    if score.is_finite() && (0.0..=1.0).contains(&score) {
        Ok(score)
    } else {
        Err(ClassifierError::InvalidScore(score))
    }
}
