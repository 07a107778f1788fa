use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("ID missing '{0}' separator")]
    MissingSeparator(char),

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// Names and namespaces are lowercase DNS labels.
    #[error("invalid name '{value}': {message}")]
    InvalidName { value: String, message: String },
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    pub fn is_name_error(&self) -> bool {
        matches!(self, IdError::InvalidName { .. })
    }
}
