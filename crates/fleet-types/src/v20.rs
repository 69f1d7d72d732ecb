//! OCPP 2.0 value types (reduced set covered by the simulator)

use serde::{Deserialize, Serialize};

/// Connector status in the 2.0 dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

impl std::fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectorStatus::Available => "Available",
            ConnectorStatus::Occupied => "Occupied",
            ConnectorStatus::Reserved => "Reserved",
            ConnectorStatus::Unavailable => "Unavailable",
            ConnectorStatus::Faulted => "Faulted",
        };
        write!(f, "{}", s)
    }
}

impl From<crate::v16::ChargePointStatus> for ConnectorStatus {
    /// Collapse the 1.6 state set onto the reduced 2.0 one
    fn from(status: crate::v16::ChargePointStatus) -> Self {
        use crate::v16::ChargePointStatus as S16;
        match status {
            S16::Available => ConnectorStatus::Available,
            S16::Preparing
            | S16::Charging
            | S16::SuspendedEvse
            | S16::SuspendedEv
            | S16::Finishing => ConnectorStatus::Occupied,
            S16::Reserved => ConnectorStatus::Reserved,
            S16::Unavailable => ConnectorStatus::Unavailable,
            S16::Faulted => ConnectorStatus::Faulted,
        }
    }
}

/// Reason the station is (re)booting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

impl Default for BootReason {
    fn default() -> Self {
        BootReason::PowerUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v16::ChargePointStatus;

    #[test]
    fn test_v16_collapse() {
        assert_eq!(
            ConnectorStatus::from(ChargePointStatus::Charging),
            ConnectorStatus::Occupied
        );
        assert_eq!(
            ConnectorStatus::from(ChargePointStatus::Preparing),
            ConnectorStatus::Occupied
        );
        assert_eq!(
            ConnectorStatus::from(ChargePointStatus::Available),
            ConnectorStatus::Available
        );
        assert_eq!(
            ConnectorStatus::from(ChargePointStatus::Faulted),
            ConnectorStatus::Faulted
        );
    }

    #[test]
    fn test_boot_reason_wire_name() {
        assert_eq!(
            serde_json::to_string(&BootReason::PowerUp).unwrap(),
            "\"PowerUp\""
        );
    }
}
