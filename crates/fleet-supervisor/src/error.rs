//! Error types for the supervisor

use thiserror::Error;

/// Supervisor error types
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Top-level configuration could not be read or parsed
    #[error("Configuration error ({file}): {message}")]
    Configuration { file: String, message: String },

    /// Supervision URL list is missing or unusable
    #[error("Supervision URL error: {0}")]
    SupervisionUrl(String),

    /// Already running / not running
    #[error("Invalid lifecycle: {0}")]
    Lifecycle(String),

    /// Station-level failure during spawn
    #[error(transparent)]
    Station(#[from] fleet_station::StationError),

    /// Control-plane failure
    #[error(transparent)]
    Control(#[from] fleet_control::ControlError),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SupervisorError {
    pub fn configuration(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle(message.into())
    }
}

/// Result type alias for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;
