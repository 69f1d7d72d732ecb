//! # Fleet Types
//!
//! This crate provides the foundational types for the charging-station fleet
//! simulator: the OCPP-J message envelope, protocol version discriminators,
//! and the value types shared by the 1.6 and 2.0 dialects.

pub mod common;
pub mod error;
pub mod frame;
pub mod v16;
pub mod v20;

pub use error::*;
pub use frame::*;

/// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;

use serde::{Deserialize, Serialize};

/// OCPP protocol version spoken by a station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    #[serde(rename = "1.6")]
    V16,
    #[serde(rename = "2.0.1")]
    V201,
}

impl OcppVersion {
    /// WebSocket sub-protocol negotiated for this version
    pub fn sub_protocol(&self) -> &'static str {
        match self {
            OcppVersion::V16 => "ocpp1.6",
            OcppVersion::V201 => "ocpp2.0.1",
        }
    }
}

impl Default for OcppVersion {
    fn default() -> Self {
        OcppVersion::V16
    }
}

impl std::fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OcppVersion::V16 => write!(f, "1.6"),
            OcppVersion::V201 => write!(f, "2.0.1"),
        }
    }
}

/// Message type identifier carried as the first array element of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = OcppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            _ => Err(OcppError::InvalidMessageType(value)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(msg_type: MessageType) -> Self {
        msg_type as u8
    }
}

/// Authorization token presented by a driver
pub type IdToken = String;

/// Connector identifier. Index 0 denotes the station-global pseudo-connector;
/// physical connectors are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectorId(pub u32);

impl ConnectorId {
    /// The station-global pseudo-connector
    pub const STATION: ConnectorId = ConnectorId(0);

    /// Create a physical (non-zero) connector ID
    pub fn physical(id: u32) -> Result<Self, OcppError> {
        if id == 0 {
            Err(OcppError::InvalidConnectorId(id))
        } else {
            Ok(ConnectorId(id))
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_station(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// EVSE identifier used by the 2.0 topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvseId(pub u32);

impl EvseId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for EvseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier allocated by the CSMS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub i32);

impl TransactionId {
    pub fn new(id: i32) -> Self {
        TransactionId(id)
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(2).unwrap(), MessageType::Call);
        assert_eq!(MessageType::try_from(3).unwrap(), MessageType::CallResult);
        assert_eq!(MessageType::try_from(4).unwrap(), MessageType::CallError);
        assert!(MessageType::try_from(1).is_err());
        assert!(MessageType::try_from(5).is_err());

        assert_eq!(u8::from(MessageType::Call), 2);
        assert_eq!(u8::from(MessageType::CallError), 4);
    }

    #[test]
    fn test_connector_id() {
        let connector = ConnectorId::physical(1).unwrap();
        assert_eq!(connector.value(), 1);
        assert_eq!(connector.to_string(), "1");
        assert!(!connector.is_station());

        assert!(ConnectorId::physical(0).is_err());
        assert!(ConnectorId::STATION.is_station());
    }

    #[test]
    fn test_ocpp_version_sub_protocol() {
        assert_eq!(OcppVersion::V16.sub_protocol(), "ocpp1.6");
        assert_eq!(OcppVersion::V201.sub_protocol(), "ocpp2.0.1");
    }

    #[test]
    fn test_ocpp_version_serialization() {
        assert_eq!(
            serde_json::to_string(&OcppVersion::V16).unwrap(),
            "\"1.6\""
        );
        assert_eq!(
            serde_json::to_string(&OcppVersion::V201).unwrap(),
            "\"2.0.1\""
        );
    }

    #[test]
    fn test_transaction_id() {
        let tx_id = TransactionId::new(7);
        assert_eq!(tx_id.value(), 7);
        assert_eq!(tx_id.to_string(), "7");
    }
}
