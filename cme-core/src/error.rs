//! Error taxonomy for the change management engine
//!
//! Every failure kind is its own variant so callers can match on the kind
//! instead of inspecting messages.

use crate::types::ObjectType;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, CmeError>;

/// Errors that can occur during engine operations
#[derive(Debug, thiserror::Error)]
pub enum CmeError {
    #[error("Change Management Engine not initialized")]
    NotInitialized,

    /// A push or pull against an upstream node failed; carries the raw
    /// output of the backend so the caller can report it.
    #[error("Communication with upstream failed: {stderr}")]
    Communication { stdout: String, stderr: String },

    #[error("Repository {0} does not exist")]
    NoRepo(ObjectType),

    #[error("Metadata key {0} not found")]
    MetaKeyNotFound(String),

    #[error("Too many collisions while generating transaction ID")]
    IdCollision,

    #[error("Failed to create transaction branch: {0}")]
    TransactionBranch(String),

    #[error("Transaction ID conflict: {0}")]
    TransactionConflict(String),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Generic(String),
}

impl CmeError {
    pub(crate) fn generic(msg: impl Into<String>) -> Self {
        CmeError::Generic(msg.into())
    }
}
