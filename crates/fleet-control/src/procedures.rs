//! Control-plane procedures
//!
//! Wire names and payload shapes of the UI protocol. Requests travel as
//! `[uuid, procedureName, payload]`; the payload may carry `hashIds` to
//! target a subset of the fleet (the deprecated singular `hashId` is folded
//! in with a warning).

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Procedure names of the UI protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcedureName {
    StartSimulator,
    StopSimulator,
    ListChargingStations,
    StartChargingStation,
    StopChargingStation,
    OpenConnection,
    CloseConnection,
    StartTransaction,
    StopTransaction,
    StartAutomaticTransactionGenerator,
    StopAutomaticTransactionGenerator,
    SetSupervisionUrl,
    UpdateStatus,
    UpdateFirmwareStatus,
    Authorize,
    BootNotification,
    StatusNotification,
    Heartbeat,
    MeterValues,
    DataTransfer,
    DiagnosticsStatusNotification,
    FirmwareStatusNotification,
}

impl ProcedureName {
    /// Whether the procedure addresses the simulator itself rather than a
    /// set of stations
    pub fn is_simulator_wide(&self) -> bool {
        matches!(
            self,
            ProcedureName::StartSimulator
                | ProcedureName::StopSimulator
                | ProcedureName::ListChargingStations
        )
    }
}

impl std::fmt::Display for ProcedureName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|value| value.as_str().map(|s| s.to_string()))
            .unwrap_or_default();
        write!(f, "{}", name)
    }
}

/// Outcome carried by every control-plane response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Failure,
}

/// Common request payload: the target set plus procedure-specific fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestPayload {
    /// Stations addressed by the request; empty means the whole fleet
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hash_ids: Vec<String>,
    /// Deprecated single-station form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_ids: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RequestPayload {
    /// Target hash ids, folding the deprecated singular field in
    pub fn targets(&self) -> Vec<String> {
        let mut targets = self.hash_ids.clone();
        if let Some(hash_id) = &self.hash_id {
            warn!("Deprecated 'hashId' request field used, prefer 'hashIds'");
            if !targets.contains(hash_id) {
                targets.push(hash_id.clone());
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_procedure_wire_names() {
        assert_eq!(
            serde_json::to_string(&ProcedureName::StartChargingStation).unwrap(),
            "\"startChargingStation\""
        );
        assert_eq!(
            serde_json::to_string(&ProcedureName::StartAutomaticTransactionGenerator).unwrap(),
            "\"startAutomaticTransactionGenerator\""
        );
        let parsed: ProcedureName = serde_json::from_str("\"listChargingStations\"").unwrap();
        assert_eq!(parsed, ProcedureName::ListChargingStations);
    }

    #[test]
    fn test_response_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ResponseStatus::Success).unwrap(),
            "\"success\""
        );
        assert_eq!(
            serde_json::to_string(&ResponseStatus::Failure).unwrap(),
            "\"failure\""
        );
    }

    #[test]
    fn test_targets_folds_deprecated_field() {
        let payload: RequestPayload = serde_json::from_value(json!({
            "hashIds": ["h-A"],
            "hashId": "h-B"
        }))
        .unwrap();
        assert_eq!(payload.targets(), vec!["h-A".to_string(), "h-B".to_string()]);

        let payload: RequestPayload = serde_json::from_value(json!({})).unwrap();
        assert!(payload.targets().is_empty());
    }

    #[test]
    fn test_extra_fields_preserved() {
        let payload: RequestPayload = serde_json::from_value(json!({
            "hashIds": [],
            "vendorId": "FleetSim"
        }))
        .unwrap();
        assert_eq!(payload.extra.get("vendorId").unwrap(), "FleetSim");
    }

    #[test]
    fn test_simulator_wide() {
        assert!(ProcedureName::StartSimulator.is_simulator_wide());
        assert!(ProcedureName::ListChargingStations.is_simulator_wide());
        assert!(!ProcedureName::StartTransaction.is_simulator_wide());
    }
}
