//! Error types for the execution broker.

use flexrun_types::ExecutionState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("No code provided")]
    CodeMissing,
    #[error("Code exceeds maximum length of {max} characters ({actual} provided)")]
    CodeTooLarge { max: usize, actual: usize },
    #[error("Failed to start interpreter: {0}")]
    SpawnFailed(String),
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("Execution {id} is not waiting for input (state: {state})")]
    NotWaitingForInput { id: String, state: ExecutionState },
    #[error("Execution {id} is already {state}")]
    AlreadyFinished { id: String, state: ExecutionState },
    #[error("Failed to deliver input to {id}: {message}")]
    InputDelivery { id: String, message: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::IoError(err.to_string())
    }
}

impl BrokerError {
    /// The execution is gone or already past the point a stop could affect.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            BrokerError::ExecutionNotFound(_) | BrokerError::AlreadyFinished { .. }
        )
    }
}
