#![allow(dead_code)]

use thiserror::Error;

/// Error kinds the core distinguishes. Mapping these to transport-level
/// status codes (HTTP, WebSocket close frames, ...) is the job of the
/// outer, out-of-scope interface layer — this crate never picks a status
/// code itself.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Authz(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("failed to parse LLM response: {0}")]
    ParseErr(String),

    #[error("exhausted retries: {0}")]
    Exhausted(String),
}

impl CoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn authz(message: impl Into<String>) -> Self {
        Self::Authz(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn parse_err(message: impl Into<String>) -> Self {
        Self::ParseErr(message.into())
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::Exhausted(message.into())
    }

    /// Whether a background worker should treat this as recoverable for the
    /// surrounding item (skip and continue) rather than failing the whole job.
    pub fn is_retryable_for_background_work(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ParseErr(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::not_found("row not found"),
            other => CoreError::transient(other.to_string()),
        }
    }
}
