use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use poolkeeper_kernel::risk::{ActionEvent, ClassifierError, RiskClassifier};

/// A classifier with scripted answers.
///
/// Queued results are returned first, in order; once the queue is empty
/// every call returns the fallback. Each call's window is kept so tests can
/// assert what the gate actually scored.
#[derive(Clone)]
pub struct ScriptedClassifier {
    queued: Arc<Mutex<VecDeque<Result<f64, ClassifierError>>>>,
    fallback: Arc<Mutex<Result<f64, ClassifierError>>>,
    /// Windows passed to `score`, one entry per call
    pub call_history: Arc<Mutex<Vec<Vec<ActionEvent>>>>,
}

impl ScriptedClassifier {
    /// Every call returns `score` until told otherwise.
    pub fn new(score: f64) -> Self {
        Self {
            queued: Arc::default(),
            fallback: Arc::new(Mutex::new(Ok(score))),
            call_history: Arc::default(),
        }
    }

    /// Every call fails with `ModelUnavailable`.
    pub fn unavailable() -> Self {
        let classifier = Self::new(0.0);
        classifier.set_unavailable();
        classifier
    }

    pub fn set_score(&self, score: f64) {
        *self.fallback.lock() = Ok(score);
    }

    pub fn set_unavailable(&self) {
        *self.fallback.lock() = Err(ClassifierError::ModelUnavailable(
            "scripted outage".to_string(),
        ));
    }

    /// Answer the next call with `score`, ahead of the fallback.
    pub fn push_score(&self, score: f64) {
        self.queued.lock().push_back(Ok(score));
    }

    pub fn push_unavailable(&self) {
        self.queued.lock().push_back(Err(ClassifierError::ModelUnavailable(
            "scripted outage".to_string(),
        )));
    }

    pub fn call_count(&self) -> usize {
        self.call_history.lock().len()
    }

    pub fn last_window(&self) -> Option<Vec<ActionEvent>> {
        self.call_history.lock().last().cloned()
    }
}

#[async_trait]
impl RiskClassifier for ScriptedClassifier {
    async fn score(&self, window: &[ActionEvent]) -> Result<f64, ClassifierError> {
        self.call_history.lock().push(window.to_vec());
        if let Some(next) = self.queued.lock().pop_front() {
            return next;
        }
        self.fallback.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_answers_come_before_the_fallback() {
        let classifier = ScriptedClassifier::new(0.2);
        classifier.push_score(0.95);
        classifier.push_unavailable();

        assert_eq!(classifier.score(&[]).await, Ok(0.95));
        assert!(classifier.score(&[]).await.is_err());
        assert_eq!(classifier.score(&[]).await, Ok(0.2));
        assert_eq!(classifier.call_count(), 3);
    }
}
