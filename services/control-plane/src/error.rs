//! Error taxonomy for the control plane.
//!
//! - [`ValidationError`]: a spec is invalid; rejected before any mutation.
//! - [`TransitionError`]: an illegal phase transition was requested (a defect).
//! - [`ExternalError`]: a cloud or hypervisor call failed; retried via requeue.
//! - [`ControllerError::Timeout`]: a phase outlived its ceiling.
//!
//! Controllers never let these escape `reconcile`/`finalize`; they are folded
//! into the returned result or the resource status.

use std::time::Duration;

use labfleet_id::IdError;
use labfleet_reconcile::TransitionError;
use thiserror::Error;

use crate::store::StoreError;

/// A resource spec failed validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Name or namespace is not a valid identifier.
    #[error("invalid identity: {0}")]
    Identity(#[from] IdError),

    /// A required field is empty.
    #[error("{field} is required")]
    Required { field: &'static str },

    /// A numeric or time field is outside its allowed range.
    #[error("{field} is out of range: {message}")]
    OutOfRange { field: &'static str, message: String },

    /// The requested instance type cannot be satisfied as declared.
    #[error("invalid lab type: {0}")]
    InvalidLabType(String),

    /// The pool scaling configuration is inconsistent.
    #[error("invalid scaling config: {0}")]
    Scaling(String),
}

impl ValidationError {
    pub fn out_of_range(field: &'static str, message: impl Into<String>) -> Self {
        Self::OutOfRange {
            field,
            message: message.into(),
        }
    }
}

/// A call to an external collaborator failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExternalError {
    #[error("cloud provider error: {0}")]
    Cloud(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// The addressed instance, lab or license does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ExternalError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExternalError::NotFound(_))
    }
}

/// Everything that can go wrong inside a reconcile step.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    External(#[from] ExternalError),

    #[error("phase '{phase}' exceeded its {limit:?} ceiling")]
    Timeout { phase: &'static str, limit: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for reconcile steps.
pub type ControllerResult<T> = Result<T, ControllerError>;
