use serde::{Deserialize, Serialize};

/// Boundary errors surfaced to callers (validation, CLI, reconcilers).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum LoomError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl LoomError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LoomError::Validation(msg.into())
    }

    /// Message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            LoomError::Validation(m) | LoomError::Conflict(m) | LoomError::NotFound(m) | LoomError::Internal(m) => m,
        }
    }
}

pub type LoomResult<T> = Result<T, LoomError>;
