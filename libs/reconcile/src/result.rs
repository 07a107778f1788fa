//! Outcome of one reconciliation step.

use std::fmt;
use std::time::Duration;

/// Result returned by a controller's reconcile step.
///
/// `requeue_after` is a scheduling hint for the driving loop, never a sleep
/// inside the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    pub success: bool,
    pub error: Option<String>,
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Converged or nothing to do; no revisit needed.
    pub fn done() -> Self {
        Self {
            success: true,
            error: None,
            requeue_after: None,
        }
    }

    /// Successful step that wants another look after `after`.
    pub fn requeue(after: Duration) -> Self {
        Self {
            success: true,
            error: None,
            requeue_after: Some(after),
        }
    }

    /// Failed step that should not be retried automatically.
    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            requeue_after: None,
        }
    }

    /// Failed step to be retried after `after`.
    pub fn retry(error: impl fmt::Display, after: Duration) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            requeue_after: Some(after),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

impl Default for ReconcileResult {
    fn default() -> Self {
        Self::done()
    }
}
