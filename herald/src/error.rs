//! Application-wide error types.

use std::time::Duration;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Variants that describe caller misuse (`NotRegistered`, `AlreadyRegistered`,
/// `InvalidDelay`, `NoActiveTransaction`) are always returned synchronously.
/// Failures inside scheduled work never surface here; they are logged by the
/// component that caught them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Actor not registered: {0}")]
    NotRegistered(String),

    #[error("Actor already registered with a different instance: {0}")]
    AlreadyRegistered(String),

    #[error("Invalid delay: {0}ms")]
    InvalidDelay(i64),

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Transaction timed out after {0:?}")]
    TransactionTimeout(Duration),

    #[error("Transaction rolled back: {0}")]
    RolledBack(String),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn invalid_schedule(msg: impl Into<String>) -> Self {
        Self::InvalidSchedule(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
