// ABOUTME: Error taxonomy surfaced by the orchestration core to its callers
// ABOUTME: Separates validation, precondition, capacity and cluster failures so callers can react

use corral_storage::StorageError;
use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cluster error: {0}")]
    Cluster(#[from] GatewayError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    /// Maps a store miss onto the matching not-found variant
    pub(crate) fn environment_lookup(id: &str, err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => Self::EnvironmentNotFound(id.to_string()),
            other => Self::Storage(other),
        }
    }

    pub(crate) fn execution_lookup(id: &str, err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => Self::ExecutionNotFound(id.to_string()),
            other => Self::Storage(other),
        }
    }
}
