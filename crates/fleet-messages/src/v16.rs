//! OCPP 1.6 message definitions
//!
//! All message types exchanged by the simulator in the 1.6 dialect,
//! organized by direction: station-initiated requests first, then the
//! CSMS-initiated (incoming) set.

use crate::{OcppAction, OcppResponse};
use chrono::{DateTime, Utc};
use fleet_types::common::*;
use fleet_types::v16::*;
use fleet_types::IdToken;
use serde::{Deserialize, Serialize};

// =============================================================================
// Station-initiated requests
// =============================================================================

/// Authorize request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    #[serde(rename = "idTag")]
    pub id_tag: IdToken,
}

impl OcppAction for AuthorizeRequest {
    const ACTION_NAME: &'static str = "Authorize";
    type Response = AuthorizeResponse;
}

/// Authorize response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    #[serde(rename = "idTagInfo")]
    pub id_tag_info: IdTagInfo,
}

impl OcppResponse for AuthorizeResponse {}

/// BootNotification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootNotificationRequest {
    #[serde(rename = "chargePointVendor")]
    pub charge_point_vendor: String,
    #[serde(rename = "chargePointModel")]
    pub charge_point_model: String,
    #[serde(
        rename = "chargePointSerialNumber",
        skip_serializing_if = "Option::is_none"
    )]
    pub charge_point_serial_number: Option<String>,
    #[serde(
        rename = "chargeBoxSerialNumber",
        skip_serializing_if = "Option::is_none"
    )]
    pub charge_box_serial_number: Option<String>,
    #[serde(rename = "firmwareVersion", skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iccid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(rename = "meterType", skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(rename = "meterSerialNumber", skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
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
    /// Heartbeat interval in seconds; doubles as the retry interval while
    /// registration is Pending/Rejected
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

/// StartTransaction request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTransactionRequest {
    #[serde(rename = "connectorId")]
    pub connector_id: u32,
    #[serde(rename = "idTag")]
    pub id_tag: IdToken,
    /// Meter register at transaction start, in Wh
    #[serde(rename = "meterStart")]
    pub meter_start: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "reservationId", skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i32>,
}

impl OcppAction for StartTransactionRequest {
    const ACTION_NAME: &'static str = "StartTransaction";
    type Response = StartTransactionResponse;
}

/// StartTransaction response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTransactionResponse {
    #[serde(rename = "idTagInfo")]
    pub id_tag_info: IdTagInfo,
    #[serde(rename = "transactionId")]
    pub transaction_id: i32,
}

impl OcppResponse for StartTransactionResponse {}

/// StopTransaction request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTransactionRequest {
    #[serde(rename = "transactionId")]
    pub transaction_id: i32,
    /// Meter register at transaction stop, in Wh
    #[serde(rename = "meterStop")]
    pub meter_stop: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "idTag", skip_serializing_if = "Option::is_none")]
    pub id_tag: Option<IdToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StopReason>,
    #[serde(rename = "transactionData", skip_serializing_if = "Option::is_none")]
    pub transaction_data: Option<Vec<MeterValue>>,
}

impl OcppAction for StopTransactionRequest {
    const ACTION_NAME: &'static str = "StopTransaction";
    type Response = StopTransactionResponse;
}

/// StopTransaction response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTransactionResponse {
    #[serde(rename = "idTagInfo", skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

impl OcppResponse for StopTransactionResponse {}

/// StatusNotification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationRequest {
    #[serde(rename = "connectorId")]
    pub connector_id: u32,
    #[serde(rename = "errorCode")]
    pub error_code: ChargePointErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    pub status: ChargePointStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "vendorErrorCode", skip_serializing_if = "Option::is_none")]
    pub vendor_error_code: Option<String>,
    #[serde(rename = "vendorId", skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
}

impl OcppAction for StatusNotificationRequest {
    const ACTION_NAME: &'static str = "StatusNotification";
    type Response = StatusNotificationResponse;
}

/// StatusNotification response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

impl OcppResponse for StatusNotificationResponse {}

/// MeterValues request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterValuesRequest {
    #[serde(rename = "connectorId")]
    pub connector_id: u32,
    #[serde(rename = "transactionId", skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    #[serde(rename = "meterValue")]
    pub meter_value: Vec<MeterValue>,
}

impl OcppAction for MeterValuesRequest {
    const ACTION_NAME: &'static str = "MeterValues";
    type Response = MeterValuesResponse;
}

/// MeterValues response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterValuesResponse {}

impl OcppResponse for MeterValuesResponse {}

/// DataTransfer request (either direction)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTransferRequest {
    #[serde(rename = "vendorId")]
    pub vendor_id: String,
    #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl OcppAction for DataTransferRequest {
    const ACTION_NAME: &'static str = "DataTransfer";
    type Response = DataTransferResponse;
}

/// DataTransfer response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl OcppResponse for DataTransferResponse {}

/// DiagnosticsStatusNotification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsStatusNotificationRequest {
    pub status: DiagnosticsStatus,
}

impl OcppAction for DiagnosticsStatusNotificationRequest {
    const ACTION_NAME: &'static str = "DiagnosticsStatusNotification";
    type Response = DiagnosticsStatusNotificationResponse;
}

/// DiagnosticsStatusNotification response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsStatusNotificationResponse {}

impl OcppResponse for DiagnosticsStatusNotificationResponse {}

/// FirmwareStatusNotification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareStatusNotificationRequest {
    pub status: FirmwareStatus,
}

impl OcppAction for FirmwareStatusNotificationRequest {
    const ACTION_NAME: &'static str = "FirmwareStatusNotification";
    type Response = FirmwareStatusNotificationResponse;
}

/// FirmwareStatusNotification response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareStatusNotificationResponse {}

impl OcppResponse for FirmwareStatusNotificationResponse {}

// =============================================================================
// CSMS-initiated (incoming) requests
// =============================================================================

/// Reset request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub reset_type: ResetType,
}

impl OcppAction for ResetRequest {
    const ACTION_NAME: &'static str = "Reset";
    type Response = ResetResponse;
}

/// Reset response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: CommandStatus,
}

impl OcppResponse for ResetResponse {}

/// ClearCache request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearCacheRequest {}

impl OcppAction for ClearCacheRequest {
    const ACTION_NAME: &'static str = "ClearCache";
    type Response = ClearCacheResponse;
}

/// ClearCache response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearCacheResponse {
    pub status: CommandStatus,
}

impl OcppResponse for ClearCacheResponse {}

/// ChangeAvailability request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAvailabilityRequest {
    #[serde(rename = "connectorId")]
    pub connector_id: u32,
    #[serde(rename = "type")]
    pub availability_type: AvailabilityType,
}

impl OcppAction for ChangeAvailabilityRequest {
    const ACTION_NAME: &'static str = "ChangeAvailability";
    type Response = ChangeAvailabilityResponse;
}

/// ChangeAvailability response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAvailabilityResponse {
    pub status: AvailabilityStatus,
}

impl OcppResponse for ChangeAvailabilityResponse {}

/// UnlockConnector request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockConnectorRequest {
    #[serde(rename = "connectorId")]
    pub connector_id: u32,
}

impl OcppAction for UnlockConnectorRequest {
    const ACTION_NAME: &'static str = "UnlockConnector";
    type Response = UnlockConnectorResponse;
}

/// UnlockConnector response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockConnectorResponse {
    pub status: UnlockStatus,
}

impl OcppResponse for UnlockConnectorResponse {}

/// GetConfiguration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetConfigurationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<String>>,
}

impl OcppAction for GetConfigurationRequest {
    const ACTION_NAME: &'static str = "GetConfiguration";
    type Response = GetConfigurationResponse;
}

/// Key/value pair returned by GetConfiguration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub readonly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// GetConfiguration response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetConfigurationResponse {
    #[serde(rename = "configurationKey", skip_serializing_if = "Option::is_none")]
    pub configuration_key: Option<Vec<KeyValue>>,
    #[serde(rename = "unknownKey", skip_serializing_if = "Option::is_none")]
    pub unknown_key: Option<Vec<String>>,
}

impl OcppResponse for GetConfigurationResponse {}

/// ChangeConfiguration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigurationRequest {
    pub key: String,
    pub value: String,
}

impl OcppAction for ChangeConfigurationRequest {
    const ACTION_NAME: &'static str = "ChangeConfiguration";
    type Response = ChangeConfigurationResponse;
}

/// ChangeConfiguration response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigurationResponse {
    pub status: ConfigurationStatus,
}

impl OcppResponse for ChangeConfigurationResponse {}

/// RemoteStartTransaction request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStartTransactionRequest {
    #[serde(rename = "idTag")]
    pub id_tag: IdToken,
    #[serde(rename = "connectorId", skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    #[serde(rename = "chargingProfile", skip_serializing_if = "Option::is_none")]
    pub charging_profile: Option<ChargingProfile>,
}

impl OcppAction for RemoteStartTransactionRequest {
    const ACTION_NAME: &'static str = "RemoteStartTransaction";
    type Response = RemoteStartTransactionResponse;
}

/// RemoteStartTransaction response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStartTransactionResponse {
    pub status: CommandStatus,
}

impl OcppResponse for RemoteStartTransactionResponse {}

/// RemoteStopTransaction request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStopTransactionRequest {
    #[serde(rename = "transactionId")]
    pub transaction_id: i32,
}

impl OcppAction for RemoteStopTransactionRequest {
    const ACTION_NAME: &'static str = "RemoteStopTransaction";
    type Response = RemoteStopTransactionResponse;
}

/// RemoteStopTransaction response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStopTransactionResponse {
    pub status: CommandStatus,
}

impl OcppResponse for RemoteStopTransactionResponse {}

/// SetChargingProfile request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetChargingProfileRequest {
    #[serde(rename = "connectorId")]
    pub connector_id: u32,
    #[serde(rename = "csChargingProfiles")]
    pub cs_charging_profiles: ChargingProfile,
}

impl OcppAction for SetChargingProfileRequest {
    const ACTION_NAME: &'static str = "SetChargingProfile";
    type Response = SetChargingProfileResponse;
}

/// SetChargingProfile response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetChargingProfileResponse {
    pub status: ChargingProfileStatus,
}

impl OcppResponse for SetChargingProfileResponse {}

/// ClearChargingProfile request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearChargingProfileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    #[serde(rename = "connectorId", skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    #[serde(
        rename = "chargingProfilePurpose",
        skip_serializing_if = "Option::is_none"
    )]
    pub charging_profile_purpose: Option<ChargingProfilePurpose>,
    #[serde(rename = "stackLevel", skip_serializing_if = "Option::is_none")]
    pub stack_level: Option<u32>,
}

impl OcppAction for ClearChargingProfileRequest {
    const ACTION_NAME: &'static str = "ClearChargingProfile";
    type Response = ClearChargingProfileResponse;
}

/// ClearChargingProfile response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearChargingProfileResponse {
    pub status: ClearChargingProfileStatus,
}

impl OcppResponse for ClearChargingProfileResponse {}

/// GetCompositeSchedule request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCompositeScheduleRequest {
    #[serde(rename = "connectorId")]
    pub connector_id: u32,
    pub duration: i32,
    #[serde(rename = "chargingRateUnit", skip_serializing_if = "Option::is_none")]
    pub charging_rate_unit: Option<ChargingRateUnit>,
}

impl OcppAction for GetCompositeScheduleRequest {
    const ACTION_NAME: &'static str = "GetCompositeSchedule";
    type Response = GetCompositeScheduleResponse;
}

/// GetCompositeSchedule response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCompositeScheduleResponse {
    pub status: GetCompositeScheduleStatus,
    #[serde(rename = "connectorId", skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    #[serde(rename = "scheduleStart", skip_serializing_if = "Option::is_none")]
    pub schedule_start: Option<DateTime<Utc>>,
    #[serde(rename = "chargingSchedule", skip_serializing_if = "Option::is_none")]
    pub charging_schedule: Option<serde_json::Value>,
}

impl OcppResponse for GetCompositeScheduleResponse {}

/// GetDiagnostics request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDiagnosticsRequest {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    #[serde(rename = "retryInterval", skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<i32>,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "stopTime", skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
}

impl OcppAction for GetDiagnosticsRequest {
    const ACTION_NAME: &'static str = "GetDiagnostics";
    type Response = GetDiagnosticsResponse;
}

/// GetDiagnostics response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDiagnosticsResponse {
    #[serde(rename = "fileName", skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl OcppResponse for GetDiagnosticsResponse {}

/// TriggerMessage request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessageRequest {
    #[serde(rename = "requestedMessage")]
    pub requested_message: MessageTrigger,
    #[serde(rename = "connectorId", skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
}

impl OcppAction for TriggerMessageRequest {
    const ACTION_NAME: &'static str = "TriggerMessage";
    type Response = TriggerMessageResponse;
}

/// TriggerMessage response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessageResponse {
    pub status: TriggerMessageStatus,
}

impl OcppResponse for TriggerMessageResponse {}

/// UpdateFirmware request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFirmwareRequest {
    pub location: String,
    #[serde(rename = "retrieveDate")]
    pub retrieve_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    #[serde(rename = "retryInterval", skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<i32>,
}

impl OcppAction for UpdateFirmwareRequest {
    const ACTION_NAME: &'static str = "UpdateFirmware";
    type Response = UpdateFirmwareResponse;
}

/// UpdateFirmware response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFirmwareResponse {}

impl OcppResponse for UpdateFirmwareResponse {}

/// ReserveNow request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveNowRequest {
    #[serde(rename = "connectorId")]
    pub connector_id: u32,
    #[serde(rename = "expiryDate")]
    pub expiry_date: DateTime<Utc>,
    #[serde(rename = "idTag")]
    pub id_tag: IdToken,
    #[serde(rename = "parentIdTag", skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<IdToken>,
    #[serde(rename = "reservationId")]
    pub reservation_id: i32,
}

impl OcppAction for ReserveNowRequest {
    const ACTION_NAME: &'static str = "ReserveNow";
    type Response = ReserveNowResponse;
}

/// ReserveNow response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveNowResponse {
    pub status: ReservationStatus,
}

impl OcppResponse for ReserveNowResponse {}

/// CancelReservation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelReservationRequest {
    #[serde(rename = "reservationId")]
    pub reservation_id: i32,
}

impl OcppAction for CancelReservationRequest {
    const ACTION_NAME: &'static str = "CancelReservation";
    type Response = CancelReservationResponse;
}

/// CancelReservation response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelReservationResponse {
    pub status: CommandStatus,
}

impl OcppResponse for CancelReservationResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boot_notification_skips_absent_options() {
        let request = BootNotificationRequest {
            charge_point_vendor: "FleetSim".to_string(),
            charge_point_model: "Virtual".to_string(),
            charge_point_serial_number: None,
            charge_box_serial_number: None,
            firmware_version: Some("1.0.0".to_string()),
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "chargePointVendor": "FleetSim",
                "chargePointModel": "Virtual",
                "firmwareVersion": "1.0.0"
            })
        );
    }

    #[test]
    fn test_boot_notification_response_decode() {
        let response: BootNotificationResponse = serde_json::from_value(json!({
            "currentTime": "2024-01-01T00:00:00Z",
            "interval": 30,
            "status": "Accepted"
        }))
        .unwrap();
        assert_eq!(response.status, RegistrationStatus::Accepted);
        assert_eq!(response.interval, 30);
    }

    #[test]
    fn test_start_transaction_wire_shape() {
        let request = StartTransactionRequest {
            connector_id: 1,
            id_tag: "TAG-1".to_string(),
            meter_start: 0,
            timestamp: Utc::now(),
            reservation_id: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["connectorId"], 1);
        assert_eq!(value["idTag"], "TAG-1");
        assert_eq!(value["meterStart"], 0);
        assert!(value.get("reservationId").is_none());
    }

    #[test]
    fn test_reset_type_field_name() {
        let request: ResetRequest = serde_json::from_value(json!({"type": "Soft"})).unwrap();
        assert_eq!(request.reset_type, ResetType::Soft);
    }

    #[test]
    fn test_get_configuration_round_trip() {
        let response = GetConfigurationResponse {
            configuration_key: Some(vec![KeyValue {
                key: "HeartbeatInterval".to_string(),
                readonly: false,
                value: Some("30".to_string()),
            }]),
            unknown_key: Some(vec!["Bogus".to_string()]),
        };
        let json = serde_json::to_string(&response).unwrap();
        let decoded: GetConfigurationResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_stop_transaction_carries_transaction_data() {
        let request = StopTransactionRequest {
            transaction_id: 7,
            meter_stop: 1500,
            timestamp: Utc::now(),
            id_tag: None,
            reason: Some(StopReason::Local),
            transaction_data: Some(vec![MeterValue {
                timestamp: Utc::now(),
                sampled_value: vec![SampledValue::measured(
                    Measurand::EnergyActiveImportRegister,
                    "1500".to_string(),
                    UnitOfMeasure::Wh,
                )],
            }]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["transactionId"], 7);
        assert_eq!(value["reason"], "Local");
        assert_eq!(value["transactionData"][0]["sampledValue"][0]["unit"], "Wh");
    }
}
