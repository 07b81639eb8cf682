//! Error types for decoding protocol messages.

use thiserror::Error;

/// Errors raised while decoding an inbound duplex message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// The payload had no string `type` field.
    #[error("Message is missing a 'type' field")]
    MissingType,

    /// The `type` field named a message this server does not understand.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// A known message type was missing required fields.
    #[error("Malformed '{message_type}' message: {reason}")]
    Malformed {
        message_type: String,
        reason: String,
    },
}

impl ProtocolError {
    /// Create a new invalid JSON error.
    pub fn invalid_json(msg: impl Into<String>) -> Self {
        Self::InvalidJson(msg.into())
    }

    /// Create a new malformed message error.
    pub fn malformed(message_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            message_type: message_type.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for protocol decoding.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
