//! Error types for the HTTP front end.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use flexrun_core::BrokerError;
use flexrun_types::{ErrorResponse, ExecutionId};
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can occur while serving a request.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Rejected by the broker
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Execution ran out of time
    #[error("Execution timed out")]
    Timeout {
        execution_id: ExecutionId,
        stderr: Vec<String>,
    },

    /// Execution exited with an error
    #[error("Execution failed")]
    ExecutionFailed {
        execution_id: ExecutionId,
        stderr: Vec<String>,
    },

    /// Server configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Create a new missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    /// Create a new configuration error.
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Convert ServerError to HTTP status code
impl ServerError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::Broker(e) => match e {
                BrokerError::CodeMissing
                | BrokerError::CodeTooLarge { .. }
                | BrokerError::NotWaitingForInput { .. } => 400,
                BrokerError::ExecutionNotFound(_) => 404,
                BrokerError::AlreadyFinished { .. } => 409,
                BrokerError::SpawnFailed(_)
                | BrokerError::InputDelivery { .. }
                | BrokerError::ConfigError(_)
                | BrokerError::IoError(_) => 500,
            },
            ServerError::MissingField(_) => 400,
            ServerError::Timeout { .. } => 504,
            ServerError::ExecutionFailed { .. }
            | ServerError::Config(_)
            | ServerError::Internal(_) => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::Broker(e) => match e {
                BrokerError::CodeMissing => "code_missing",
                BrokerError::CodeTooLarge { .. } => "code_too_large",
                BrokerError::SpawnFailed(_) => "spawn_failed",
                BrokerError::ExecutionNotFound(_) => "execution_not_found",
                BrokerError::NotWaitingForInput { .. } => "not_waiting_for_input",
                BrokerError::AlreadyFinished { .. } => "already_finished",
                BrokerError::InputDelivery { .. } => "input_delivery_failed",
                BrokerError::ConfigError(_) => "config_error",
                BrokerError::IoError(_) => "io_error",
            },
            ServerError::MissingField(_) => "missing_field",
            ServerError::Timeout { .. } => "timeout",
            ServerError::ExecutionFailed { .. } => "execution_failed",
            ServerError::Config(_) => "config_error",
            ServerError::Internal(_) => "internal_error",
        }
    }

    /// Build the JSON body sent to the client.
    pub fn to_body(&self) -> ErrorResponse {
        let (execution_id, stderr) = match self {
            ServerError::Timeout {
                execution_id,
                stderr,
            }
            | ServerError::ExecutionFailed {
                execution_id,
                stderr,
            } => (Some(execution_id.clone()), stderr.clone()),
            _ => (None, Vec::new()),
        };

        let details = match self {
            ServerError::Timeout { stderr, .. } | ServerError::ExecutionFailed { stderr, .. }
                if !stderr.is_empty() =>
            {
                Some(stderr.join("\n"))
            }
            ServerError::Timeout { .. } | ServerError::ExecutionFailed { .. } => None,
            other => Some(other.error_type().to_string()),
        };

        ErrorResponse {
            error: self.to_string(),
            details,
            execution_id,
            stderr,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            log::error!("Request failed ({}): {}", self.error_type(), self);
        } else {
            log::warn!("Request rejected ({}): {}", self.error_type(), self);
        }
        (status, Json(self.to_body())).into_response()
    }
}
