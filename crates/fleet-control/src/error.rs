//! Error types for the control plane
//!
//! Every variant maps onto the wire: [`ControlError::ws_close_code`] gives
//! the WebSocket close code and the `StatusCode` conversion the HTTP status
//! the UI server reports for it.

use axum::http::StatusCode;
use thiserror::Error;

/// Control-plane error types
#[derive(Error, Debug)]
pub enum ControlError {
    /// Message is not a `[uuid, procedure, payload]` array
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Payload is structurally valid JSON but not a valid request
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Unknown procedure name
    #[error("Unknown procedure: {0}")]
    UnknownProcedure(String),

    /// UI server failed to bind or serve
    #[error("Server error: {0}")]
    Server(String),

    /// Authentication failed
    #[error("Authentication failed")]
    Unauthorized,

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server(message.into())
    }

    /// WebSocket close code reported for this error: 1002 for protocol
    /// violations, 1007 for invalid payloads, 1011 otherwise
    pub fn ws_close_code(&self) -> u16 {
        match self {
            ControlError::Protocol(_) => 1002,
            ControlError::InvalidPayload(_) | ControlError::UnknownProcedure(_) => 1007,
            _ => 1011,
        }
    }
}

impl From<&ControlError> for StatusCode {
    fn from(error: &ControlError) -> Self {
        match error {
            ControlError::Unauthorized => StatusCode::UNAUTHORIZED,
            ControlError::Protocol(_)
            | ControlError::InvalidPayload(_)
            | ControlError::UnknownProcedure(_) => StatusCode::BAD_REQUEST,
            ControlError::Server(_) | ControlError::Serialization(_) | ControlError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Result type alias for control-plane operations
pub type ControlResult<T> = Result<T, ControlError>;
