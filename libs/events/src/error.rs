//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when building or publishing events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// A required envelope field was not set on the builder.
    #[error("missing required envelope field: {0}")]
    MissingField(&'static str),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The publisher could not deliver the event.
    #[error("publish failed: {0}")]
    Publish(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
