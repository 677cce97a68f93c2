//! Unified error types for Conclave

use thiserror::Error;

/// Unified error type for all Conclave operations
#[derive(Error, Debug)]
pub enum ConclaveError {
    // Caller input errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    // Agent substrate errors
    #[error("Agent execution failed: {0}")]
    Execution(String),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Duplicate agent name: {0}")]
    DuplicateAgentName(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // Infrastructure errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl ConclaveError {
    /// Unknown task, loop, checkpoint or agent id
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::AgentNotFound(_))
    }

    /// Operation invalid for the current state
    pub fn is_state_conflict(&self) -> bool {
        matches!(self, Self::StateConflict(_))
    }

    /// Failure raised by the agent substrate
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            Self::Execution(_) | Self::UnknownAgentType(_) | Self::DuplicateAgentName(_)
        )
    }
}

/// Result type alias using ConclaveError
pub type Result<T> = std::result::Result<T, ConclaveError>;
