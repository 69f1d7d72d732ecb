//! Connector and EVSE state
//!
//! Each physical connector carries availability, OCPP status, transaction
//! fields, energy registers, authorization state, a pending reservation and
//! installed charging profiles. Stations expose either a flat connector map
//! or an EVSE map with nested connectors, never both. Status changes go
//! through the 1.6 transition table; an illegal transition is refused and
//! logged by the caller.

use fleet_types::common::{AvailabilityType, Reservation};
use fleet_types::v16::{ChargePointStatus, ChargingProfile};
use fleet_types::IdToken;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mutable state of one physical connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorState {
    pub availability: AvailabilityType,
    /// Last notified status; `None` until the first StatusNotification
    pub status: Option<ChargePointStatus>,
    /// Status emitted right after boot accept
    pub boot_status: Option<ChargePointStatus>,
    pub transaction_started: bool,
    pub transaction_id: Option<i32>,
    pub transaction_id_tag: Option<IdToken>,
    pub transaction_start: Option<chrono::DateTime<chrono::Utc>>,
    /// Lifetime energy register, in Wh
    pub energy_active_import_register_value: f64,
    /// Energy delivered within the running transaction, in Wh
    pub transaction_energy_active_import_register_value: f64,
    pub authorize_id_tag: Option<IdToken>,
    pub id_tag_authorized: bool,
    pub local_authorize_id_tag: Option<IdToken>,
    pub id_tag_local_authorized: bool,
    pub reservation: Option<Reservation>,
    pub charging_profiles: Vec<ChargingProfile>,
}

impl Default for ConnectorState {
    fn default() -> Self {
        Self {
            availability: AvailabilityType::Operative,
            status: None,
            boot_status: None,
            transaction_started: false,
            transaction_id: None,
            transaction_id_tag: None,
            transaction_start: None,
            energy_active_import_register_value: 0.0,
            transaction_energy_active_import_register_value: 0.0,
            authorize_id_tag: None,
            id_tag_authorized: false,
            local_authorize_id_tag: None,
            id_tag_local_authorized: false,
            reservation: None,
            charging_profiles: Vec::new(),
        }
    }
}

impl ConnectorState {
    pub fn is_operative(&self) -> bool {
        self.availability == AvailabilityType::Operative
    }

    /// Record a started transaction, keeping `transaction_id` and
    /// `transaction_started` in lockstep
    pub fn begin_transaction(&mut self, transaction_id: i32, id_tag: IdToken) {
        self.transaction_started = true;
        self.transaction_id = Some(transaction_id);
        self.transaction_id_tag = Some(id_tag);
        self.transaction_start = Some(chrono::Utc::now());
        self.transaction_energy_active_import_register_value = 0.0;
    }

    /// Reset every transaction-scoped field
    pub fn end_transaction(&mut self) {
        self.transaction_started = false;
        self.transaction_id = None;
        self.transaction_id_tag = None;
        self.transaction_start = None;
        self.transaction_energy_active_import_register_value = 0.0;
        self.authorize_id_tag = None;
        self.id_tag_authorized = false;
        self.local_authorize_id_tag = None;
        self.id_tag_local_authorized = false;
    }

    /// Status the connector should settle on when no transaction is running
    pub fn idle_status(&self, station_operative: bool) -> ChargePointStatus {
        if !station_operative || !self.is_operative() {
            ChargePointStatus::Unavailable
        } else if self.reservation.is_some() {
            ChargePointStatus::Reserved
        } else {
            ChargePointStatus::Available
        }
    }
}

/// Mutable state of one EVSE (2.0 topology)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvseState {
    pub availability: AvailabilityType,
    pub connectors: BTreeMap<u32, ConnectorState>,
}

impl Default for EvseState {
    fn default() -> Self {
        Self {
            availability: AvailabilityType::Operative,
            connectors: BTreeMap::new(),
        }
    }
}

/// Connector topology of a station: flat connectors or EVSE-grouped
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Topology {
    Connectors(BTreeMap<u32, ConnectorState>),
    Evses(BTreeMap<u32, EvseState>),
}

impl Topology {
    /// Physical connector ids, in order (index 0 excluded)
    pub fn connector_ids(&self) -> Vec<u32> {
        match self {
            Topology::Connectors(connectors) => {
                connectors.keys().copied().filter(|id| *id != 0).collect()
            }
            Topology::Evses(evses) => evses
                .iter()
                .filter(|(id, _)| **id != 0)
                .flat_map(|(_, evse)| evse.connectors.keys().copied())
                .collect(),
        }
    }

    pub fn number_of_connectors(&self) -> u32 {
        self.connector_ids().len() as u32
    }

    pub fn number_of_evses(&self) -> u32 {
        match self {
            Topology::Connectors(_) => 0,
            Topology::Evses(evses) => evses.keys().filter(|id| **id != 0).count() as u32,
        }
    }

    pub fn connector(&self, connector_id: u32) -> Option<&ConnectorState> {
        match self {
            Topology::Connectors(connectors) => connectors.get(&connector_id),
            Topology::Evses(evses) => evses
                .values()
                .find_map(|evse| evse.connectors.get(&connector_id)),
        }
    }

    pub fn connector_mut(&mut self, connector_id: u32) -> Option<&mut ConnectorState> {
        match self {
            Topology::Connectors(connectors) => connectors.get_mut(&connector_id),
            Topology::Evses(evses) => evses
                .values_mut()
                .find_map(|evse| evse.connectors.get_mut(&connector_id)),
        }
    }

    /// EVSE id that owns a connector, when EVSE-grouped
    pub fn evse_of(&self, connector_id: u32) -> Option<u32> {
        match self {
            Topology::Connectors(_) => None,
            Topology::Evses(evses) => evses
                .iter()
                .find(|(_, evse)| evse.connectors.contains_key(&connector_id))
                .map(|(id, _)| *id),
        }
    }

    /// Whether any sibling connector on the same EVSE runs a transaction
    pub fn sibling_has_transaction(&self, connector_id: u32) -> bool {
        match self {
            Topology::Connectors(_) => false,
            Topology::Evses(evses) => {
                let Some(evse_id) = self.evse_of(connector_id) else {
                    return false;
                };
                evses
                    .get(&evse_id)
                    .map(|evse| {
                        evse.connectors
                            .iter()
                            .any(|(id, c)| *id != connector_id && c.transaction_started)
                    })
                    .unwrap_or(false)
            }
        }
    }

    /// Count of connectors with a running transaction
    pub fn running_transactions(&self) -> u32 {
        self.connector_ids()
            .iter()
            .filter_map(|id| self.connector(*id))
            .filter(|c| c.transaction_started)
            .count() as u32
    }
}

/// Legal OCPP 1.6 connector status transitions. Re-notifying the current
/// status is always allowed.
pub fn is_legal_transition(from: Option<ChargePointStatus>, to: ChargePointStatus) -> bool {
    use ChargePointStatus::*;
    let Some(from) = from else {
        // First notification after boot may announce any status
        return true;
    };
    if from == to {
        return true;
    }
    match from {
        Available => matches!(
            to,
            Preparing | Charging | SuspendedEv | SuspendedEvse | Reserved | Unavailable | Faulted
        ),
        Preparing => matches!(
            to,
            Available | Charging | SuspendedEv | SuspendedEvse | Finishing | Faulted
        ),
        Charging => matches!(
            to,
            Available | SuspendedEv | SuspendedEvse | Finishing | Unavailable | Faulted
        ),
        SuspendedEv => matches!(
            to,
            Available | Charging | SuspendedEvse | Finishing | Unavailable | Faulted
        ),
        SuspendedEvse => matches!(
            to,
            Available | Charging | SuspendedEv | Finishing | Unavailable | Faulted
        ),
        Finishing => matches!(to, Available | Preparing | Unavailable | Faulted),
        Reserved => matches!(to, Available | Preparing | Unavailable | Faulted),
        Unavailable => matches!(
            to,
            Available | Preparing | Charging | SuspendedEv | SuspendedEvse | Faulted
        ),
        // Fault recovery may land anywhere
        Faulted => true,
    }
}
