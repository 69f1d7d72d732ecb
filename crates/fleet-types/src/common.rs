//! Value types shared by the 1.6 and 2.0 dialects

use crate::{ConnectorId, IdToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registration status returned in a BootNotification response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    /// Station is accepted by the CSMS; the message sequence may begin
    Accepted,
    /// Station is not yet accepted; only BootNotification may be retried
    Pending,
    /// Station is rejected
    Rejected,
}

/// Authorization status for an id tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    ConcurrentTx,
}

/// Authorization information attached to an id tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdTagInfo {
    pub status: AuthorizationStatus,
    #[serde(rename = "expiryDate", skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(rename = "parentIdTag", skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<IdToken>,
}

impl IdTagInfo {
    pub fn accepted() -> Self {
        Self {
            status: AuthorizationStatus::Accepted,
            expiry_date: None,
            parent_id_tag: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == AuthorizationStatus::Accepted
    }
}

/// Current waveform delivered by the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurrentOutType {
    AC,
    DC,
}

impl Default for CurrentOutType {
    fn default() -> Self {
        CurrentOutType::AC
    }
}

/// Power unit used by a station template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerUnit {
    W,
    #[serde(rename = "kW")]
    KW,
}

impl PowerUnit {
    /// Divider applied to convert template figures to watt-scale values
    pub fn divider(&self) -> f64 {
        match self {
            PowerUnit::W => 1.0,
            PowerUnit::KW => 1000.0,
        }
    }
}

impl Default for PowerUnit {
    fn default() -> Self {
        PowerUnit::W
    }
}

/// Sampled measurand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Measurand {
    #[serde(rename = "Energy.Active.Import.Register")]
    EnergyActiveImportRegister,
    #[serde(rename = "Power.Active.Import")]
    PowerActiveImport,
    #[serde(rename = "Current.Import")]
    CurrentImport,
    #[serde(rename = "Voltage")]
    Voltage,
    #[serde(rename = "SoC")]
    StateOfCharge,
    #[serde(rename = "Temperature")]
    Temperature,
    #[serde(rename = "Frequency")]
    Frequency,
}

impl Measurand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Measurand::EnergyActiveImportRegister => "Energy.Active.Import.Register",
            Measurand::PowerActiveImport => "Power.Active.Import",
            Measurand::CurrentImport => "Current.Import",
            Measurand::Voltage => "Voltage",
            Measurand::StateOfCharge => "SoC",
            Measurand::Temperature => "Temperature",
            Measurand::Frequency => "Frequency",
        }
    }
}

/// Electrical phase a sampled value refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    L1,
    L2,
    L3,
    N,
    #[serde(rename = "L1-N")]
    L1N,
    #[serde(rename = "L2-N")]
    L2N,
    #[serde(rename = "L3-N")]
    L3N,
    #[serde(rename = "L1-L2")]
    L1L2,
    #[serde(rename = "L2-L3")]
    L2L3,
    #[serde(rename = "L3-L1")]
    L3L1,
}

/// Detail of when a reading was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingContext {
    #[serde(rename = "Interruption.Begin")]
    InterruptionBegin,
    #[serde(rename = "Interruption.End")]
    InterruptionEnd,
    #[serde(rename = "Other")]
    Other,
    #[serde(rename = "Sample.Clock")]
    SampleClock,
    #[serde(rename = "Sample.Periodic")]
    SamplePeriodic,
    #[serde(rename = "Transaction.Begin")]
    TransactionBegin,
    #[serde(rename = "Transaction.End")]
    TransactionEnd,
    #[serde(rename = "Trigger")]
    Trigger,
}

/// Value format of a sampled value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueFormat {
    Raw,
    SignedData,
}

/// Location of the measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Body,
    Cable,
    #[serde(rename = "EV")]
    Ev,
    Inlet,
    Outlet,
}

/// Unit of a sampled value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOfMeasure {
    Wh,
    #[serde(rename = "kWh")]
    KWh,
    W,
    #[serde(rename = "kW")]
    KW,
    V,
    A,
    Percent,
    Celsius,
}

/// One sampled value inside a meter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ReadingContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<ValueFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<Measurand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitOfMeasure>,
}

impl SampledValue {
    /// A bare measurand sample with value and unit
    pub fn measured(measurand: Measurand, value: String, unit: UnitOfMeasure) -> Self {
        Self {
            value,
            context: Some(ReadingContext::SamplePeriodic),
            format: None,
            measurand: Some(measurand),
            phase: None,
            location: None,
            unit: Some(unit),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_context(mut self, context: ReadingContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Collection of sampled values taken at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "sampledValue")]
    pub sampled_value: Vec<SampledValue>,
}

/// Reason a transaction was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum StopReason {
    DeAuthorized,
    EmergencyStop,
    #[serde(rename = "EVDisconnected")]
    EvDisconnected,
    HardReset,
    Local,
    Other,
    PowerLoss,
    Reboot,
    Remote,
    SoftReset,
    UnlockCommand,
}

impl Default for StopReason {
    fn default() -> Self {
        StopReason::Local
    }
}

/// Firmware installation status reported to the CSMS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum FirmwareStatus {
    Downloaded,
    DownloadFailed,
    Downloading,
    Idle,
    InstallationFailed,
    Installing,
    Installed,
}

impl Default for FirmwareStatus {
    fn default() -> Self {
        FirmwareStatus::Idle
    }
}

/// Diagnostics upload status reported to the CSMS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DiagnosticsStatus {
    Idle,
    Uploaded,
    UploadFailed,
    Uploading,
}

/// Availability requested by a ChangeAvailability command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AvailabilityType {
    Inoperative,
    Operative,
}

/// Availability change outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AvailabilityStatus {
    Accepted,
    Rejected,
    Scheduled,
}

/// Reservation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ReservationStatus {
    Accepted,
    Faulted,
    Occupied,
    Rejected,
    Unavailable,
}

/// A reservation held against a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i32,
    #[serde(rename = "connectorId")]
    pub connector_id: ConnectorId,
    #[serde(rename = "idTag")]
    pub id_tag: IdToken,
    #[serde(rename = "parentIdTag", skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<IdToken>,
    #[serde(rename = "expiryDate")]
    pub expiry_date: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date <= now
    }
}

/// Why a reservation is being removed. Expired, ReservationCanceled and
/// ReplaceExisting all release a Reserved connector; TransactionStarted hands
/// the connector over to the new transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationTerminationReason {
    Expired,
    ReservationCanceled,
    ReplaceExisting,
    TransactionStarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurand_wire_names() {
        assert_eq!(
            serde_json::to_string(&Measurand::EnergyActiveImportRegister).unwrap(),
            "\"Energy.Active.Import.Register\""
        );
        assert_eq!(
            serde_json::to_string(&Measurand::StateOfCharge).unwrap(),
            "\"SoC\""
        );
    }

    #[test]
    fn test_phase_wire_names() {
        assert_eq!(serde_json::to_string(&Phase::L1).unwrap(), "\"L1\"");
        assert_eq!(serde_json::to_string(&Phase::L1N).unwrap(), "\"L1-N\"");
        assert_eq!(serde_json::to_string(&Phase::L2L3).unwrap(), "\"L2-L3\"");
    }

    #[test]
    fn test_sampled_value_optional_fields_skipped() {
        let sample = SampledValue::measured(
            Measurand::Voltage,
            "230".to_string(),
            UnitOfMeasure::V,
        );
        let json = serde_json::to_string(&sample).unwrap();
        assert!(!json.contains("phase"));
        assert!(!json.contains("location"));
        assert!(json.contains("\"Voltage\""));
    }

    #[test]
    fn test_id_tag_info() {
        let info = IdTagInfo::accepted();
        assert!(info.is_accepted());
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"status":"Accepted"}"#);
    }

    #[test]
    fn test_reservation_expiry() {
        let reservation = Reservation {
            id: 1,
            connector_id: ConnectorId(1),
            id_tag: "TAG-1".to_string(),
            parent_id_tag: None,
            expiry_date: Utc::now() - chrono::Duration::seconds(1),
        };
        assert!(reservation.is_expired(Utc::now()));
    }

    #[test]
    fn test_stop_reason_wire_name() {
        assert_eq!(
            serde_json::to_string(&StopReason::EvDisconnected).unwrap(),
            "\"EVDisconnected\""
        );
        assert_eq!(serde_json::to_string(&StopReason::Local).unwrap(), "\"Local\"");
    }

    #[test]
    fn test_power_unit_divider() {
        assert_eq!(PowerUnit::W.divider(), 1.0);
        assert_eq!(PowerUnit::KW.divider(), 1000.0);
    }
}
