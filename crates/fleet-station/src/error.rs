//! Error types for the station engine

use fleet_types::OcppError;
use thiserror::Error;

/// Station engine error types
#[derive(Error, Debug)]
pub enum StationError {
    /// Template file could not be read or parsed
    #[error("Template error ({file}): {message}")]
    Template { file: String, message: String },

    /// Persisted configuration could not be read or written
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation attempted while the station is not started
    #[error("Station {0} is not started")]
    NotStarted(String),

    /// Operation attempted while the station is already started
    #[error("Station {0} is already started")]
    AlreadyStarted(String),

    /// Connector lookup failed
    #[error("Unknown connector {connector_id} on station {station}")]
    UnknownConnector { station: String, connector_id: u32 },

    /// Guard refused a transaction operation
    #[error("Transaction error on connector {connector_id}: {message}")]
    Transaction { connector_id: u32, message: String },

    /// Connection handling failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// ATG failure
    #[error("Transaction generator error: {0}")]
    Generator(String),

    /// Underlying protocol error
    #[error(transparent)]
    Ocpp(#[from] OcppError),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StationError {
    pub fn template(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transaction(connector_id: u32, message: impl Into<String>) -> Self {
        Self::Transaction {
            connector_id,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }
}

/// Result type alias for station operations
pub type StationResult<T> = Result<T, StationError>;
