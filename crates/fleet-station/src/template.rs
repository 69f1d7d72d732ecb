//! Station templates
//!
//! A template file describes a family of stations: identity block, electrical
//! characteristics, connector (or EVSE) topology, OCPP configuration keys and
//! the optional transaction-generator section. Templates are content-hashed;
//! the hash feeds both the persisted-configuration gate and the stable
//! `hash_id` of every station spawned from the template.

use crate::error::{StationError, StationResult};
use fleet_types::common::{CurrentOutType, PowerUnit};
use fleet_types::v16::ChargePointStatus;
use fleet_types::OcppVersion;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default voltage for AC stations
const DEFAULT_VOLTAGE_AC: f64 = 230.0;
/// Default voltage for DC stations
const DEFAULT_VOLTAGE_DC: f64 = 400.0;

/// Template power figure: one value for the whole family, or one per station
/// index (selected `(index - 1) % len`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PowerSpec {
    Single(f64),
    PerStation(Vec<f64>),
}

impl PowerSpec {
    /// Pick the power figure for a 1-based station index
    pub fn for_index(&self, index: u32) -> f64 {
        match self {
            PowerSpec::Single(power) => *power,
            PowerSpec::PerStation(powers) if powers.is_empty() => 0.0,
            PowerSpec::PerStation(powers) => {
                powers[(index.saturating_sub(1) as usize) % powers.len()]
            }
        }
    }
}

impl Default for PowerSpec {
    fn default() -> Self {
        PowerSpec::Single(0.0)
    }
}

/// One or many supervision URLs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SupervisionUrls {
    Single(String),
    Many(Vec<String>),
}

impl SupervisionUrls {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            SupervisionUrls::Single(url) => vec![url.clone()],
            SupervisionUrls::Many(urls) => urls.clone(),
        }
    }
}

/// Per-connector template block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorTemplate {
    /// Status emitted right after boot accept; Available when absent
    pub boot_status: Option<ChargePointStatus>,
}

/// Per-EVSE template block (2.0 topology)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvseTemplate {
    pub connectors: BTreeMap<String, ConnectorTemplate>,
}

/// OCPP configuration key seeded from the template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfigurationKey {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub reboot: bool,
}

/// Template `Configuration` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateConfiguration {
    pub configuration_key: Vec<TemplateConfigurationKey>,
}

/// Id-tag selection policy of the transaction generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdTagDistribution {
    Random,
    RoundRobin,
    ConnectorAffinity,
}

impl Default for IdTagDistribution {
    fn default() -> Self {
        IdTagDistribution::Random
    }
}

/// Automatic transaction generator section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AtgConfig {
    pub enable: bool,
    /// Transaction duration bounds, in seconds
    pub min_duration: u64,
    pub max_duration: u64,
    /// Idle gap bounds between two attempts, in seconds
    pub min_delay_between_two_transactions: u64,
    pub max_delay_between_two_transactions: u64,
    /// Per-attempt probability of starting a transaction, in [0, 1]
    pub probability_of_start: f64,
    /// Generator horizon from first start, in hours
    pub stop_after_hours: f64,
    /// Stop the generator before a reconnect attempt
    pub stop_on_connection_failure: bool,
    /// Send Authorize before StartTransaction
    pub require_authorize: bool,
    pub id_tag_distribution: IdTagDistribution,
}

impl Default for AtgConfig {
    fn default() -> Self {
        Self {
            enable: false,
            min_duration: 60,
            max_duration: 120,
            min_delay_between_two_transactions: 15,
            max_delay_between_two_transactions: 30,
            probability_of_start: 1.0,
            stop_after_hours: 0.25,
            stop_on_connection_failure: true,
            require_authorize: true,
            id_tag_distribution: IdTagDistribution::Random,
        }
    }
}

/// Firmware upgrade simulation knobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FirmwareUpgrade {
    /// Stop and restart the station around the simulated install
    pub reset: bool,
}

fn default_true() -> bool {
    true
}

fn default_connection_timeout() -> u64 {
    crate::DEFAULT_CONNECTION_TIMEOUT
}

fn default_reset_time() -> u64 {
    30
}

fn default_registration_max_retries() -> i32 {
    -1
}

fn default_auto_reconnect_max_retries() -> i32 {
    -1
}

/// Station template as read from disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StationTemplate {
    pub charge_point_model: String,
    pub charge_point_vendor: String,
    pub charge_point_serial_number_prefix: Option<String>,
    pub firmware_version: Option<String>,
    /// Pattern with a trailing `.{patch}` placeholder filled at init
    pub firmware_version_pattern: Option<String>,
    pub firmware_upgrade: Option<FirmwareUpgrade>,
    /// Display-name prefix; the template file stem when absent
    pub base_name: Option<String>,
    pub power: PowerSpec,
    pub power_unit: PowerUnit,
    pub number_of_phases: Option<u8>,
    pub current_out_type: CurrentOutType,
    pub voltage_out: Option<f64>,
    pub ocpp_version: OcppVersion,
    pub supervision_urls: Option<SupervisionUrls>,
    /// Publish the supervision URL as an OCPP configuration key
    pub supervision_url_ocpp_configuration: bool,
    pub supervision_url_ocpp_key: Option<String>,
    pub use_connector_id0: bool,
    pub random_connectors: bool,
    pub auto_register: bool,
    pub amperage_limitation_ocpp_key: Option<String>,
    pub power_shared_by_connectors: bool,
    /// -1 = retry forever, 0 = single attempt
    pub registration_max_retries: i32,
    /// -1 = unlimited, 0 = reconnect disabled
    pub auto_reconnect_max_retries: i32,
    pub reconnect_exponential_delay: bool,
    /// Connection/handshake timeout, in seconds
    pub connection_timeout: u64,
    /// Protocol-level ping interval, in seconds; 0 disables
    pub web_socket_ping_interval: u64,
    pub payload_schema_validation: bool,
    pub ocpp_strict_compliance: bool,
    pub out_of_order_end_meter_values: bool,
    pub begin_end_meter_values: bool,
    pub custom_value_limitation_meter_values: bool,
    /// Pause between stop and restart on reset, in seconds
    pub reset_time: u64,
    pub id_tags_file: Option<PathBuf>,
    pub ocpp_persistent_configuration: bool,
    pub station_info_persistent_configuration: bool,
    pub automatic_transaction_generator_persistent_configuration: bool,
    /// Exactly one of `connectors` / `evses` should be populated
    pub connectors: Option<BTreeMap<String, ConnectorTemplate>>,
    pub evses: Option<BTreeMap<String, EvseTemplate>>,
    pub configuration: Option<TemplateConfiguration>,
    pub automatic_transaction_generator: Option<AtgConfig>,
}

impl Default for StationTemplate {
    fn default() -> Self {
        Self {
            charge_point_model: "Virtual".to_string(),
            charge_point_vendor: "FleetSim".to_string(),
            charge_point_serial_number_prefix: None,
            firmware_version: Some("1.0.0".to_string()),
            firmware_version_pattern: None,
            firmware_upgrade: None,
            base_name: None,
            power: PowerSpec::Single(22000.0),
            power_unit: PowerUnit::W,
            number_of_phases: None,
            current_out_type: CurrentOutType::AC,
            voltage_out: None,
            ocpp_version: OcppVersion::V16,
            supervision_urls: None,
            supervision_url_ocpp_configuration: false,
            supervision_url_ocpp_key: None,
            use_connector_id0: true,
            random_connectors: false,
            auto_register: false,
            amperage_limitation_ocpp_key: None,
            power_shared_by_connectors: false,
            registration_max_retries: default_registration_max_retries(),
            auto_reconnect_max_retries: default_auto_reconnect_max_retries(),
            reconnect_exponential_delay: false,
            connection_timeout: default_connection_timeout(),
            web_socket_ping_interval: 0,
            payload_schema_validation: true,
            ocpp_strict_compliance: true,
            out_of_order_end_meter_values: false,
            begin_end_meter_values: false,
            custom_value_limitation_meter_values: true,
            reset_time: default_reset_time(),
            id_tags_file: None,
            ocpp_persistent_configuration: true,
            station_info_persistent_configuration: true,
            automatic_transaction_generator_persistent_configuration: true,
            connectors: None,
            evses: None,
            configuration: None,
            automatic_transaction_generator: None,
        }
    }
}

impl StationTemplate {
    /// Parse a template from raw JSON bytes
    pub fn from_bytes(file: &Path, bytes: &[u8]) -> StationResult<Self> {
        let template: StationTemplate = serde_json::from_slice(bytes)
            .map_err(|e| StationError::template(file.display().to_string(), e.to_string()))?;
        template.check(file)?;
        Ok(template)
    }

    /// Structural checks beyond what serde enforces
    fn check(&self, file: &Path) -> StationResult<()> {
        let has_connectors = self.connectors.as_ref().is_some_and(|c| !c.is_empty());
        let has_evses = self.evses.as_ref().is_some_and(|e| !e.is_empty());
        if has_connectors == has_evses {
            return Err(StationError::template(
                file.display().to_string(),
                "exactly one of Connectors/Evses must be populated",
            ));
        }
        if let Some(atg) = &self.automatic_transaction_generator {
            if !(0.0..=1.0).contains(&atg.probability_of_start) {
                return Err(StationError::template(
                    file.display().to_string(),
                    "probabilityOfStart must be within [0, 1]",
                ));
            }
            if atg.min_duration > atg.max_duration
                || atg.min_delay_between_two_transactions
                    > atg.max_delay_between_two_transactions
            {
                return Err(StationError::template(
                    file.display().to_string(),
                    "generator duration/delay bounds are inverted",
                ));
            }
        }
        Ok(())
    }

    /// Number of physical connectors described by the template
    pub fn number_of_connectors(&self) -> u32 {
        if let Some(connectors) = &self.connectors {
            connectors
                .keys()
                .filter(|k| k.as_str() != "0")
                .count() as u32
        } else if let Some(evses) = &self.evses {
            evses
                .iter()
                .filter(|(k, _)| k.as_str() != "0")
                .map(|(_, evse)| evse.connectors.len() as u32)
                .sum()
        } else {
            0
        }
    }

    /// Number of EVSEs described by the template (2.0 topology)
    pub fn number_of_evses(&self) -> u32 {
        self.evses
            .as_ref()
            .map(|evses| evses.iter().filter(|(k, _)| k.as_str() != "0").count() as u32)
            .unwrap_or(0)
    }

    /// Voltage figure, defaulted by current type
    pub fn voltage(&self) -> f64 {
        self.voltage_out.unwrap_or(match self.current_out_type {
            CurrentOutType::AC => DEFAULT_VOLTAGE_AC,
            CurrentOutType::DC => DEFAULT_VOLTAGE_DC,
        })
    }

    /// Phase count, defaulted by current type (AC three-phase, DC none)
    pub fn phases(&self) -> u8 {
        self.number_of_phases.unwrap_or(match self.current_out_type {
            CurrentOutType::AC => 3,
            CurrentOutType::DC => 0,
        })
    }

    /// Maximum power in watts for a 1-based station index
    pub fn maximum_power_w(&self, index: u32) -> f64 {
        self.power.for_index(index) * self.power_unit.divider()
    }

    /// Maximum amperage derived from power, voltage and phase count
    pub fn maximum_amperage(&self, index: u32) -> f64 {
        let phases = self.phases().max(1) as f64;
        self.maximum_power_w(index) / (phases * self.voltage())
    }
}

/// SHA-256 hex digest of raw template bytes
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Stable station identity derived from template path, index and content hash
pub fn station_hash_id(template_file: &Path, index: u32, template_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template_file.display().to_string().as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(template_hash.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Display id for a station spawned from a template
pub fn charging_station_id(template_file: &Path, template: &StationTemplate, index: u32) -> String {
    let base = template.base_name.clone().unwrap_or_else(|| {
        template_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "station".to_string())
    });
    format!("{}-{:05}", base, index)
}

/// Fill a `firmware_version_pattern` with a synthesized patch number
pub fn synthesize_firmware_version(template: &StationTemplate, index: u32) -> Option<String> {
    match (&template.firmware_version_pattern, &template.firmware_version) {
        (Some(pattern), _) => Some(pattern.replace("{patch}", &(index % 10).to_string())),
        (None, Some(version)) => Some(version.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn template_json(connector_count: u32) -> String {
        let connectors: BTreeMap<String, ConnectorTemplate> = (0..=connector_count)
            .map(|i| (i.to_string(), ConnectorTemplate::default()))
            .collect();
        serde_json::to_string(&serde_json::json!({
            "chargePointModel": "Virtual",
            "chargePointVendor": "FleetSim",
            "power": 22000.0,
            "powerUnit": "W",
            "connectors": connectors,
        }))
        .unwrap()
    }

    #[test]
    fn test_template_parse_defaults() {
        let path = PathBuf::from("station.json");
        let template = StationTemplate::from_bytes(&path, template_json(2).as_bytes()).unwrap();
        assert_eq!(template.number_of_connectors(), 2);
        assert_eq!(template.phases(), 3);
        assert_eq!(template.voltage(), 230.0);
        assert!(template.use_connector_id0);
        assert_eq!(template.registration_max_retries, -1);
    }

    #[test]
    fn test_template_requires_topology() {
        let path = PathBuf::from("station.json");
        let result = StationTemplate::from_bytes(
            &path,
            br#"{"chargePointModel": "Virtual", "chargePointVendor": "FleetSim"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_template_rejects_both_topologies() {
        let path = PathBuf::from("station.json");
        let result = StationTemplate::from_bytes(
            &path,
            serde_json::to_string(&serde_json::json!({
                "chargePointModel": "Virtual",
                "chargePointVendor": "FleetSim",
                "connectors": {"1": {}},
                "evses": {"1": {"connectors": {"1": {}}}},
            }))
            .unwrap()
            .as_bytes(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_power_spec_per_station() {
        let spec = PowerSpec::PerStation(vec![11000.0, 22000.0]);
        assert_eq!(spec.for_index(1), 11000.0);
        assert_eq!(spec.for_index(2), 22000.0);
        assert_eq!(spec.for_index(3), 11000.0);
    }

    #[test]
    fn test_maximum_amperage() {
        let path = PathBuf::from("station.json");
        let template = StationTemplate::from_bytes(&path, template_json(1).as_bytes()).unwrap();
        // 22 kW across 3 phases at 230 V
        let amperage = template.maximum_amperage(1);
        assert!((amperage - 22000.0 / (3.0 * 230.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_content_hash_is_stable() {
        let first = content_hash(b"same content");
        let second = content_hash(b"same content");
        assert_eq!(first, second);
        assert_ne!(first, content_hash(b"other content"));
    }

    #[test]
    fn test_station_hash_id_varies_by_index() {
        let path = PathBuf::from("station.json");
        let hash = content_hash(b"content");
        let first = station_hash_id(&path, 1, &hash);
        let second = station_hash_id(&path, 2, &hash);
        assert_ne!(first, second);
        assert_eq!(first.len(), 16);
    }

    #[test]
    fn test_charging_station_id() {
        let path = PathBuf::from("/templates/ac-22kw.json");
        let template = StationTemplate::default();
        assert_eq!(charging_station_id(&path, &template, 3), "ac-22kw-00003");
    }

    #[test]
    fn test_firmware_version_pattern() {
        let template = StationTemplate {
            firmware_version_pattern: Some("2.1.{patch}".to_string()),
            ..Default::default()
        };
        assert_eq!(
            synthesize_firmware_version(&template, 13),
            Some("2.1.3".to_string())
        );
    }

    #[test]
    fn test_atg_bounds_validation() {
        let path = PathBuf::from("station.json");
        let result = StationTemplate::from_bytes(
            &path,
            serde_json::to_string(&serde_json::json!({
                "chargePointModel": "Virtual",
                "chargePointVendor": "FleetSim",
                "connectors": {"1": {}},
                "automaticTransactionGenerator": {
                    "enable": true,
                    "minDuration": 120,
                    "maxDuration": 60
                }
            }))
            .unwrap()
            .as_bytes(),
        );
        assert!(result.is_err());
    }
}
