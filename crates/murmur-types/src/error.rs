use thiserror::Error;

use crate::models::UserId;

/// Outcome of every rejected operation in the messaging core.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed input; never persisted.
    #[error("{0}")]
    Validation(String),

    /// Bad credentials or bad secret code.
    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Receiver is neither connected nor known to the store.
    #[error("recipient {0} does not exist")]
    InvalidRecipient(UserId),

    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth(reason.into())
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound(reason.into())
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict(reason.into())
    }
}
