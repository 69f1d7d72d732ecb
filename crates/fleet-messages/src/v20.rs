//! OCPP 2.0 message definitions
//!
//! The simulator covers the boot/heartbeat/status subset of the 2.0 dialect;
//! the incoming action set answers NotImplemented at the service layer.

use crate::{OcppAction, OcppResponse};
use chrono::{DateTime, Utc};
use fleet_types::common::RegistrationStatus;
use fleet_types::v20::{BootReason, ConnectorStatus};
use serde::{Deserialize, Serialize};

/// Identity block nested inside a 2.0 BootNotification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingStationType {
    pub model: String,
    #[serde(rename = "vendorName")]
    pub vendor_name: String,
    #[serde(rename = "firmwareVersion", skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(rename = "serialNumber", skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// BootNotification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootNotificationRequest {
    #[serde(rename = "chargingStation")]
    pub charging_station: ChargingStationType,
    pub reason: BootReason,
}

impl OcppAction for BootNotificationRequest {
    const ACTION_NAME: &'static str = "BootNotification";
    type Response = BootNotificationResponse;
}

/// BootNotification response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootNotificationResponse {
    #[serde(rename = "currentTime")]
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
}

impl OcppResponse for BootNotificationResponse {}

/// Heartbeat request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

impl OcppAction for HeartbeatRequest {
    const ACTION_NAME: &'static str = "Heartbeat";
    type Response = HeartbeatResponse;
}

/// Heartbeat response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(rename = "currentTime")]
    pub current_time: DateTime<Utc>,
}

impl OcppResponse for HeartbeatResponse {}

/// StatusNotification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationRequest {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "connectorStatus")]
    pub connector_status: ConnectorStatus,
    #[serde(rename = "evseId")]
    pub evse_id: u32,
    #[serde(rename = "connectorId")]
    pub connector_id: u32,
}

impl OcppAction for StatusNotificationRequest {
    const ACTION_NAME: &'static str = "StatusNotification";
    type Response = StatusNotificationResponse;
}

/// StatusNotification response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

impl OcppResponse for StatusNotificationResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boot_notification_wire_shape() {
        let request = BootNotificationRequest {
            charging_station: ChargingStationType {
                model: "Virtual".to_string(),
                vendor_name: "FleetSim".to_string(),
                firmware_version: None,
                serial_number: None,
            },
            reason: BootReason::PowerUp,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "chargingStation": {"model": "Virtual", "vendorName": "FleetSim"},
                "reason": "PowerUp"
            })
        );
    }

    #[test]
    fn test_status_notification_wire_shape() {
        let request = StatusNotificationRequest {
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            connector_status: ConnectorStatus::Available,
            evse_id: 1,
            connector_id: 1,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["connectorStatus"], "Available");
        assert_eq!(value["evseId"], 1);
    }
}
