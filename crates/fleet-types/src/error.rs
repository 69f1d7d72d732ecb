//! Error types for OCPP operations

use thiserror::Error;

/// Main error type for OCPP operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OcppError {
    /// Invalid message type identifier
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    /// Invalid connector ID (must be > 0 for physical connectors)
    #[error("Invalid connector ID: {0}")]
    InvalidConnectorId(u32),

    /// JSON serialization/deserialization error
    #[error("JSON error: {message}")]
    Json { message: String },

    /// Protocol violation (malformed frame, unknown action, bad message id)
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// Payload fails validation
    #[error("Formation violation: {message}")]
    FormationViolation { message: String },

    /// A cached request passed its deadline
    #[error("Request timeout: {command} after {timeout_secs}s")]
    RequestTimeout { command: String, timeout_secs: u64 },

    /// Operation attempted in a state that refuses it
    #[error("Invalid state for {operation}: {state}")]
    InvalidState { operation: String, state: String },

    /// Non-boot OCPP traffic attempted before the CSMS accepted the station
    #[error("Security: {operation} attempted before registration was accepted")]
    NotRegistered { operation: String },

    /// File I/O failure, categorized by POSIX-style code
    #[error("I/O error ({kind}): {message}")]
    Io { kind: IoErrorKind, message: String },

    /// WebSocket transport failure
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The CSMS replied with a CALLERROR frame
    #[error("Call error {code}: {description}")]
    CallError {
        code: CallErrorCode,
        description: String,
        details: String,
    },

    /// Request dropped because the connection closed underneath it
    #[error("Connection closed while awaiting {command}")]
    ConnectionClosed { command: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl OcppError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    pub fn formation(message: impl Into<String>) -> Self {
        Self::FormationViolation {
            message: message.into(),
        }
    }

    pub fn invalid_state(operation: impl Into<String>, state: impl Into<String>) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// POSIX-style I/O error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    NotFound,
    AlreadyExists,
    AccessDenied,
    PermissionDenied,
    Other,
}

impl std::fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoErrorKind::NotFound => write!(f, "not-found"),
            IoErrorKind::AlreadyExists => write!(f, "already-exists"),
            IoErrorKind::AccessDenied => write!(f, "access-denied"),
            IoErrorKind::PermissionDenied => write!(f, "permission-denied"),
            IoErrorKind::Other => write!(f, "other"),
        }
    }
}

impl From<std::io::Error> for OcppError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => IoErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => IoErrorKind::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
            _ => IoErrorKind::Other,
        };
        OcppError::Io {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for OcppError {
    fn from(err: serde_json::Error) -> Self {
        OcppError::Json {
            message: err.to_string(),
        }
    }
}

/// OCPP CALLERROR codes as defined in the specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CallErrorCode {
    /// Requested Action is not known by receiver
    NotImplemented,
    /// Requested Action is recognized but not supported by the receiver
    NotSupported,
    /// An internal error occurred while processing the Action
    InternalError,
    /// Payload for Action is incomplete
    ProtocolError,
    /// A security issue prevented the receiver from completing the Action
    SecurityError,
    /// Payload is syntactically incorrect or not conform the PDU structure
    FormationViolation,
    /// At least one field contains an invalid value
    PropertyConstraintViolation,
    /// At least one field violates occurrence constraints
    OccurrenceConstraintViolation,
    /// At least one field violates data type constraints
    TypeConstraintViolation,
    /// Any other error
    GenericError,
}

impl CallErrorCode {
    /// Wire string as defined in the OCPP spec
    pub fn as_str(&self) -> &'static str {
        match self {
            CallErrorCode::NotImplemented => "NotImplemented",
            CallErrorCode::NotSupported => "NotSupported",
            CallErrorCode::InternalError => "InternalError",
            CallErrorCode::ProtocolError => "ProtocolError",
            CallErrorCode::SecurityError => "SecurityError",
            CallErrorCode::FormationViolation => "FormationViolation",
            CallErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            CallErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            CallErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            CallErrorCode::GenericError => "GenericError",
        }
    }

    /// Parse the wire string; `None` for unknown codes
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NotImplemented" => Some(CallErrorCode::NotImplemented),
            "NotSupported" => Some(CallErrorCode::NotSupported),
            "InternalError" => Some(CallErrorCode::InternalError),
            "ProtocolError" => Some(CallErrorCode::ProtocolError),
            "SecurityError" => Some(CallErrorCode::SecurityError),
            "FormationViolation" => Some(CallErrorCode::FormationViolation),
            "PropertyConstraintViolation" => Some(CallErrorCode::PropertyConstraintViolation),
            "OccurrenceConstraintViolation" => Some(CallErrorCode::OccurrenceConstraintViolation),
            "TypeConstraintViolation" => Some(CallErrorCode::TypeConstraintViolation),
            "GenericError" => Some(CallErrorCode::GenericError),
            _ => None,
        }
    }
}

impl std::fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result type alias for OCPP operations
pub type OcppResult<T> = Result<T, OcppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_code_round_trip() {
        for code in [
            CallErrorCode::NotImplemented,
            CallErrorCode::ProtocolError,
            CallErrorCode::FormationViolation,
            CallErrorCode::GenericError,
        ] {
            assert_eq!(CallErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(CallErrorCode::parse("Bogus"), None);
    }

    #[test]
    fn test_io_error_categorization() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        match OcppError::from(err) {
            OcppError::Io { kind, .. } => assert_eq!(kind, IoErrorKind::NotFound),
            other => panic!("Expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_display() {
        let err = OcppError::RequestTimeout {
            command: "Heartbeat".to_string(),
            timeout_secs: 60,
        };
        assert_eq!(err.to_string(), "Request timeout: Heartbeat after 60s");

        let err = OcppError::NotRegistered {
            operation: "StartTransaction".to_string(),
        };
        assert!(err.to_string().contains("before registration"));
    }

    #[test]
    fn test_error_clone_eq() {
        let err = OcppError::invalid_state("startTransaction", "Faulted");
        assert_eq!(err.clone(), err);
    }
}
