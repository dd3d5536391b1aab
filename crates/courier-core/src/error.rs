//! Error types and result handling for broker operations.
//!
//! Separates caller-facing validation and existence outcomes from
//! infrastructure failures so the delivery engine can tell which store errors
//! are worth a local retry.

use std::fmt;

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and broker operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The claim on a delivery was lost before its outcome was recorded.
    ///
    /// Happens when the lease expired and another worker re-claimed the
    /// delivery, or the delivery already reached a terminal state.
    #[error("Claim lost: {0}")]
    ClaimLost(String),
}

impl CoreError {
    /// Creates a not-found error for an entity kind and identifier.
    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::NotFound(format!("{entity} {id}"))
    }

    /// Creates an already-exists error for an entity kind and identifier.
    pub fn already_exists(entity: &str, id: impl fmt::Display) -> Self {
        Self::AlreadyExists(format!("{entity} {id}"))
    }

    /// Creates an invalid-input error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Returns true for infrastructure failures that may succeed if retried.
    ///
    /// Validation, existence and claim outcomes are deterministic and never
    /// transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
