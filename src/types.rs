//! Shared error type for Barracks

use thiserror::Error;

/// Errors surfaced by the core and the HTTP adapter
#[derive(Debug, Error)]
pub enum BarracksError {
    /// Rejected input: bad targeting rule, status value, deadline, lengths
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced KPI, status record or user does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed (after retries, where retried)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BarracksError {
    /// HTTP status code this error maps to
    pub fn status_code(&self) -> u16 {
        match self {
            BarracksError::Validation(_) | BarracksError::Json(_) => 400,
            BarracksError::NotFound(_) => 404,
            BarracksError::Conflict(_) => 409,
            _ => 500,
        }
    }

    /// Whether a retry of the same operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BarracksError::Conflict(_) | BarracksError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, BarracksError>;
