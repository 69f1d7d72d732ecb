//! # Station engine
//!
//! One [`StationEngine`] per simulated charging station. The engine owns the
//! WebSocket to the CSMS, the request cache, connector/EVSE state, the OCPP
//! configuration keys and the transaction generator handle, and drives the
//! boot/heartbeat/status/meter-values sequence. Engines are cheap to clone;
//! clones share the same state and may be moved into timer and reader tasks.

use crate::atg::{Atg, AtgStatus};
use crate::config_keys::{keys, ConfigurationKey, OcppConfigKeys};
use crate::connection::{self, WsConnection, WsReader};
use crate::connectors::{is_legal_transition, ConnectorState, EvseState, Topology};
use crate::error::{StationError, StationResult};
use crate::id_tags::IdTagsCache;
use crate::meter::{self, MeterContext};
use crate::ocpp;
use crate::persist::{self, PersistedStationConfiguration};
use crate::request_cache::PendingRequests;
use crate::template::{charging_station_id, synthesize_firmware_version, StationTemplate};
use crate::{
    DEFAULT_BOOT_RETRY_INTERVAL, DEFAULT_HEARTBEAT_INTERVAL, MESSAGE_BUFFER_CAPACITY,
    OCPP_WS_COMMAND_TIMEOUT,
};
use chrono::{DateTime, Utc};
use fleet_messages::v16::{
    AuthorizeRequest, MeterValuesRequest, StartTransactionRequest, StopTransactionRequest,
};
use fleet_messages::{OcppAction, Validate};
use fleet_types::common::{
    AvailabilityType, CurrentOutType, FirmwareStatus, Measurand, MeterValue, ReadingContext,
    RegistrationStatus, Reservation, ReservationTerminationReason, StopReason,
};
use fleet_types::v16::ChargePointStatus;
use fleet_types::{Frame, OcppError, OcppResult, OcppVersion};
use futures_util::StreamExt;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use url::Url;

/// Identity and electrical block of a station, derived at initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationInfo {
    pub hash_id: String,
    pub charging_station_id: String,
    pub index: u32,
    pub template_hash: String,
    pub ocpp_version: OcppVersion,
    pub charge_point_model: String,
    pub charge_point_vendor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    /// Maximum station power, in W
    pub maximum_power: f64,
    pub maximum_amperage: f64,
    pub voltage_out: f64,
    pub number_of_phases: u8,
    pub current_out_type: CurrentOutType,
}

/// Version-independent view of a BootNotification response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
}

/// Lifecycle events published towards the hosting worker
#[derive(Debug, Clone)]
pub enum StationEvent {
    Started { hash_id: String },
    Stopped { hash_id: String },
    Registered { hash_id: String },
    Disconnected { hash_id: String, code: u16 },
    StatusChanged {
        hash_id: String,
        connector_id: u32,
        status: ChargePointStatus,
    },
    TransactionStarted {
        hash_id: String,
        connector_id: u32,
        transaction_id: i32,
    },
    TransactionStopped {
        hash_id: String,
        connector_id: u32,
        transaction_id: i32,
    },
    FirmwareStatusChanged {
        hash_id: String,
        status: FirmwareStatus,
    },
}

/// Point-in-time station view served over the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSnapshot {
    pub hash_id: String,
    pub charging_station_id: String,
    pub started: bool,
    pub registration_status: Option<RegistrationStatus>,
    pub ocpp_version: OcppVersion,
    pub supervision_url: String,
    pub firmware_status: FirmwareStatus,
    pub connectors: Vec<ConnectorSnapshot>,
}

/// Per-connector view inside a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorSnapshot {
    pub connector_id: u32,
    pub status: Option<ChargePointStatus>,
    pub availability: AvailabilityType,
    pub transaction_id: Option<i32>,
}

/// Options for one outgoing request
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Allow the request before the CSMS accepted the station (triggered
    /// messages, boot)
    pub bypass_gate: bool,
    /// Fail instead of buffering when the socket is down
    pub skip_buffering: bool,
}

/// Everything needed to build one engine
#[derive(Debug, Clone)]
pub struct StationBuild {
    pub template_file: PathBuf,
    pub template: StationTemplate,
    pub template_hash: String,
    /// 1-based station index within the template family
    pub index: u32,
    /// Pre-selected supervision URL (base, without the station path segment)
    pub supervision_url: Url,
    /// Directory for persisted station configurations
    pub config_dir: PathBuf,
}

pub(crate) struct EngineInner {
    pub(crate) build: StationBuild,
    pub(crate) info: RwLock<StationInfo>,
    pub(crate) config_keys: RwLock<OcppConfigKeys>,
    pub(crate) topology: RwLock<Topology>,
    pub(crate) station_availability: RwLock<AvailabilityType>,
    pub(crate) boot_response: RwLock<Option<BootResponse>>,
    pub(crate) firmware_status: RwLock<FirmwareStatus>,
    pub(crate) supervision_url: RwLock<Url>,
    pub(crate) started: AtomicBool,
    pub(crate) starting: AtomicBool,
    pub(crate) stopping: AtomicBool,
    pub(crate) ws: RwLock<Option<Arc<WsConnection>>>,
    pub(crate) pending: PendingRequests,
    pub(crate) message_buffer: Mutex<VecDeque<(String, String)>>,
    pub(crate) reconnect_retry_count: AtomicU32,
    pub(crate) ws_connection_restarted: AtomicBool,
    pub(crate) heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) ping_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) reader_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) meter_handles: Mutex<HashMap<u32, JoinHandle<()>>>,
    pub(crate) atg: RwLock<Option<Arc<Atg>>>,
    pub(crate) atg_statuses: RwLock<BTreeMap<u32, AtgStatus>>,
    pub(crate) id_tags: Arc<IdTagsCache>,
    pub(crate) event_tx: mpsc::UnboundedSender<StationEvent>,
}

/// The per-station actor
#[derive(Clone)]
pub struct StationEngine {
    inner: Arc<EngineInner>,
}

impl StationEngine {
    pub fn new(
        build: StationBuild,
        id_tags: Arc<IdTagsCache>,
        event_tx: mpsc::UnboundedSender<StationEvent>,
    ) -> Self {
        let station_id = charging_station_id(&build.template_file, &build.template, build.index);
        let info = StationInfo {
            hash_id: crate::template::station_hash_id(
                &build.template_file,
                build.index,
                &build.template_hash,
            ),
            charging_station_id: station_id,
            index: build.index,
            template_hash: build.template_hash.clone(),
            ocpp_version: build.template.ocpp_version,
            charge_point_model: build.template.charge_point_model.clone(),
            charge_point_vendor: build.template.charge_point_vendor.clone(),
            charge_point_serial_number: build
                .template
                .charge_point_serial_number_prefix
                .as_ref()
                .map(|prefix| format!("{}{:05}", prefix, build.index)),
            firmware_version: synthesize_firmware_version(&build.template, build.index),
            maximum_power: build.template.maximum_power_w(build.index),
            maximum_amperage: build.template.maximum_amperage(build.index),
            voltage_out: build.template.voltage(),
            number_of_phases: build.template.phases(),
            current_out_type: build.template.current_out_type,
        };
        let supervision_url = build.supervision_url.clone();
        Self {
            inner: Arc::new(EngineInner {
                build,
                info: RwLock::new(info),
                config_keys: RwLock::new(OcppConfigKeys::new()),
                topology: RwLock::new(Topology::Connectors(BTreeMap::new())),
                station_availability: RwLock::new(AvailabilityType::Operative),
                boot_response: RwLock::new(None),
                firmware_status: RwLock::new(FirmwareStatus::Idle),
                supervision_url: RwLock::new(supervision_url),
                started: AtomicBool::new(false),
                starting: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                ws: RwLock::new(None),
                pending: PendingRequests::new(),
                message_buffer: Mutex::new(VecDeque::new()),
                reconnect_retry_count: AtomicU32::new(0),
                ws_connection_restarted: AtomicBool::new(false),
                heartbeat_handle: Mutex::new(None),
                ping_handle: Mutex::new(None),
                reader_handle: Mutex::new(None),
                meter_handles: Mutex::new(HashMap::new()),
                atg: RwLock::new(None),
                atg_statuses: RwLock::new(BTreeMap::new()),
                id_tags,
                event_tx,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.inner
    }

    pub fn template(&self) -> &StationTemplate {
        &self.inner.build.template
    }

    pub async fn info(&self) -> StationInfo {
        self.inner.info.read().await.clone()
    }

    pub async fn hash_id(&self) -> String {
        self.inner.info.read().await.hash_id.clone()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub async fn registration_status(&self) -> Option<RegistrationStatus> {
        self.inner
            .boot_response
            .read()
            .await
            .as_ref()
            .map(|r| r.status)
    }

    pub async fn is_registered(&self) -> bool {
        self.registration_status().await == Some(RegistrationStatus::Accepted)
    }

    pub(crate) fn emit(&self, event: StationEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Materialize station state: merge any persisted configuration whose
    /// template hash still matches, rebuild otherwise, install the default
    /// OCPP keys and persist the result.
    pub async fn initialize(&self) -> StationResult<()> {
        let template = &self.inner.build.template;
        let config_path = self.configuration_path().await;

        let persisted = if template.ocpp_persistent_configuration {
            persist::load(&config_path).await?
        } else {
            None
        };
        let reusable = persisted
            .as_ref()
            .filter(|p| p.station_info.template_hash == self.inner.build.template_hash);

        match reusable {
            Some(persisted) => {
                debug!(
                    station = %persisted.station_info.charging_station_id,
                    "Restoring persisted configuration"
                );
                *self.inner.config_keys.write().await =
                    OcppConfigKeys::from_entries(persisted.configuration_key.clone());
                if let Some(topology) = persisted.topology() {
                    *self.inner.topology.write().await = topology;
                } else {
                    *self.inner.topology.write().await = self.topology_from_template();
                }
                if template.automatic_transaction_generator_persistent_configuration {
                    *self.inner.atg_statuses.write().await =
                        persisted.automatic_transaction_generator_statuses.clone();
                }
            }
            None => {
                *self.inner.config_keys.write().await = OcppConfigKeys::new();
                *self.inner.topology.write().await = self.topology_from_template();
                self.inner.atg_statuses.write().await.clear();
            }
        }

        self.install_template_keys().await;
        self.install_default_keys().await;
        self.persist_configuration().await?;
        Ok(())
    }

    fn topology_from_template(&self) -> Topology {
        let template = &self.inner.build.template;
        if let Some(evses) = &template.evses {
            let mut map = BTreeMap::new();
            let mut next_connector = 1u32;
            for (evse_key, evse_template) in evses {
                let Ok(evse_id) = evse_key.parse::<u32>() else {
                    warn!(key = %evse_key, "Ignoring non-numeric EVSE key");
                    continue;
                };
                if evse_id == 0 {
                    continue;
                }
                let mut evse = EvseState::default();
                for (_, connector_template) in &evse_template.connectors {
                    let mut connector = ConnectorState::default();
                    connector.boot_status = connector_template.boot_status;
                    evse.connectors.insert(next_connector, connector);
                    next_connector += 1;
                }
                map.insert(evse_id, evse);
            }
            Topology::Evses(map)
        } else {
            let mut entries: Vec<ConnectorState> = template
                .connectors
                .iter()
                .flatten()
                .filter(|(key, _)| key.as_str() != "0")
                .map(|(_, connector_template)| {
                    let mut connector = ConnectorState::default();
                    connector.boot_status = connector_template.boot_status;
                    connector
                })
                .collect();
            if template.random_connectors {
                entries.shuffle(&mut rand::thread_rng());
            }
            Topology::Connectors(
                entries
                    .into_iter()
                    .enumerate()
                    .map(|(position, connector)| (position as u32 + 1, connector))
                    .collect(),
            )
        }
    }

    async fn install_template_keys(&self) {
        let Some(configuration) = &self.inner.build.template.configuration else {
            return;
        };
        let mut store = self.inner.config_keys.write().await;
        for entry in &configuration.configuration_key {
            store.add_if_absent(ConfigurationKey {
                key: entry.key.clone(),
                value: entry.value.clone(),
                readonly: entry.readonly,
                visible: entry.visible,
                reboot: entry.reboot,
            });
        }
    }

    async fn install_default_keys(&self) {
        let template = &self.inner.build.template;
        let info = self.inner.info.read().await.clone();
        let topology = self.inner.topology.read().await;
        let connector_ids = topology.connector_ids();
        let number_of_connectors = topology.number_of_connectors();
        drop(topology);

        let mut store = self.inner.config_keys.write().await;
        store.add_if_absent(ConfigurationKey::new(keys::HEARTBEAT_INTERVAL, "0"));
        store.add_if_absent(ConfigurationKey::new(keys::HEARTBEAT_INTERVAL_LEGACY, "0").hidden());
        store.add_if_absent(ConfigurationKey::new(
            keys::SUPPORTED_FEATURE_PROFILES,
            "Core,FirmwareManagement,LocalAuthListManagement,SmartCharging,RemoteTrigger",
        ));
        store.add_if_absent(
            ConfigurationKey::new(keys::NUMBER_OF_CONNECTORS, number_of_connectors.to_string())
                .readonly(),
        );
        store.add_if_absent(ConfigurationKey::new(
            keys::METER_VALUES_SAMPLED_DATA,
            Measurand::EnergyActiveImportRegister.as_str(),
        ));
        store.add_if_absent(ConfigurationKey::new(
            keys::METER_VALUE_SAMPLE_INTERVAL,
            "60",
        ));
        let phase_rotation = connector_ids
            .iter()
            .map(|id| format!("{}.RST", id))
            .collect::<Vec<_>>()
            .join(",");
        store.add_if_absent(ConfigurationKey::new(
            keys::CONNECTOR_PHASE_ROTATION,
            phase_rotation,
        ));
        store.add_if_absent(ConfigurationKey::new(
            keys::AUTHORIZE_REMOTE_TX_REQUESTS,
            "true",
        ));
        store.add_if_absent(ConfigurationKey::new(
            keys::CONNECTION_TIMEOUT,
            crate::DEFAULT_CONNECTION_TIMEOUT.to_string(),
        ));
        store.add_if_absent(ConfigurationKey::new(
            keys::WEB_SOCKET_PING_INTERVAL,
            template.web_socket_ping_interval.to_string(),
        ));
        if store
            .get(keys::SUPPORTED_FEATURE_PROFILES)
            .is_some_and(|entry| entry.value.contains("LocalAuthListManagement"))
        {
            store.add_if_absent(ConfigurationKey::new(keys::LOCAL_AUTH_LIST_ENABLED, "false"));
        }
        if template.supervision_url_ocpp_configuration {
            let key = template
                .supervision_url_ocpp_key
                .clone()
                .unwrap_or_else(|| "ConnectionUrl".to_string());
            store.add_if_absent(ConfigurationKey::new(
                key,
                self.inner.supervision_url.read().await.to_string(),
            ));
        }
        if let Some(amperage_key) = &template.amperage_limitation_ocpp_key {
            store.add_if_absent(
                ConfigurationKey::new(
                    amperage_key.clone(),
                    format!("{}", info.maximum_amperage.round()),
                )
                .readonly(),
            );
        }
    }

    async fn configuration_path(&self) -> PathBuf {
        let info = self.inner.info.read().await;
        self.inner
            .build
            .config_dir
            .join(format!("{}.json", info.charging_station_id))
    }

    /// Persist current state, gated by the template's persistence flags
    pub async fn persist_configuration(&self) -> StationResult<()> {
        let template = &self.inner.build.template;
        if !template.ocpp_persistent_configuration {
            return Ok(());
        }
        let configuration = PersistedStationConfiguration::from_state(
            self.inner.info.read().await.clone(),
            self.inner.config_keys.read().await.entries().to_vec(),
            template.automatic_transaction_generator.clone(),
            self.inner.atg_statuses.read().await.clone(),
            &*self.inner.topology.read().await,
        )?;
        persist::save(&self.configuration_path().await, &configuration).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn start(&self) -> StationResult<()> {
        let info = self.info().await;
        if self.is_started() {
            return Err(StationError::AlreadyStarted(info.charging_station_id));
        }
        self.inner.starting.store(true, Ordering::SeqCst);
        self.inner.started.store(true, Ordering::SeqCst);
        info!(station = %info.charging_station_id, "Starting station");

        if self.inner.build.template.auto_register {
            // Registration is assumed; no CSMS gating
            *self.inner.boot_response.write().await = Some(BootResponse {
                current_time: Utc::now(),
                interval: DEFAULT_HEARTBEAT_INTERVAL as i32,
                status: RegistrationStatus::Accepted,
            });
        }

        if let Err(e) = self.open_connection(false).await {
            warn!(station = %info.charging_station_id, error = %e, "Initial connection failed");
            let engine = self.clone();
            tokio::spawn(async move { engine.reconnect_loop().await });
        }
        self.inner.starting.store(false, Ordering::SeqCst);
        self.emit(StationEvent::Started {
            hash_id: info.hash_id,
        });
        Ok(())
    }

    pub async fn stop(&self, reason: Option<StopReason>) -> StationResult<()> {
        let info = self.info().await;
        if !self.is_started() {
            return Err(StationError::NotStarted(info.charging_station_id));
        }
        self.inner.stopping.store(true, Ordering::SeqCst);
        info!(station = %info.charging_station_id, "Stopping station");

        self.stop_atg(None).await;

        // Outstanding transactions are stopped properly before the socket goes
        let running: Vec<i32> = {
            let topology = self.inner.topology.read().await;
            topology
                .connector_ids()
                .iter()
                .filter_map(|id| topology.connector(*id))
                .filter_map(|c| c.transaction_id)
                .collect()
        };
        for transaction_id in running {
            if let Err(e) = self
                .stop_transaction(Some(transaction_id), reason.unwrap_or(StopReason::Local), None)
                .await
            {
                warn!(transaction_id, error = %e, "Failed to stop transaction on shutdown");
            }
        }

        self.stop_timers().await;
        self.inner.pending.fail_all(|command| OcppError::ConnectionClosed {
            command: command.to_string(),
        });
        self.inner.message_buffer.lock().await.clear();
        self.close_connection().await;

        self.inner.started.store(false, Ordering::SeqCst);
        *self.inner.boot_response.write().await = None;
        self.inner.reconnect_retry_count.store(0, Ordering::SeqCst);
        self.persist_configuration().await?;
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.emit(StationEvent::Stopped {
            hash_id: info.hash_id,
        });
        Ok(())
    }

    pub async fn reset(&self, reason: Option<StopReason>) -> StationResult<()> {
        let reset_pause = Duration::from_secs(self.inner.build.template.reset_time);
        self.stop(reason).await?;
        tokio::time::sleep(reset_pause).await;
        self.initialize().await?;
        self.start().await
    }

    async fn stop_timers(&self) {
        if let Some(handle) = self.inner.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.ping_handle.lock().await.take() {
            handle.abort();
        }
        for (_, handle) in self.inner.meter_handles.lock().await.drain() {
            handle.abort();
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Resolve the CSMS URL: the OCPP-published key when the template opts
    /// into it, the pre-selected supervision URL otherwise
    pub async fn connection_url(&self) -> StationResult<Url> {
        let template = &self.inner.build.template;
        let base = if template.supervision_url_ocpp_configuration {
            let key = template
                .supervision_url_ocpp_key
                .clone()
                .unwrap_or_else(|| "ConnectionUrl".to_string());
            match self.inner.config_keys.read().await.get(&key) {
                Some(entry) => Url::parse(&entry.value)
                    .map_err(|e| StationError::connection(format!("Bad supervision URL: {}", e)))?,
                None => self.inner.supervision_url.read().await.clone(),
            }
        } else {
            self.inner.supervision_url.read().await.clone()
        };
        let station_id = self.inner.info.read().await.charging_station_id.clone();
        let mut url = base;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StationError::connection("Supervision URL cannot be a base"))?;
            segments.pop_if_empty().push(&station_id);
        }
        Ok(url)
    }

    /// Replace the pre-selected supervision URL (control-plane operation)
    pub async fn set_supervision_url(&self, url: Url) {
        *self.inner.supervision_url.write().await = url;
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.ws.read().await.is_some()
    }

    pub fn open_connection(
        &self,
        close_opened: bool,
    ) -> Pin<Box<dyn Future<Output = StationResult<()>> + Send + '_>> {
        Box::pin(async move {
            let info = self.info().await;
            if !self.is_started() {
                return Err(StationError::NotStarted(info.charging_station_id));
            }
            if self.is_connected().await {
                if !close_opened {
                    debug!(station = %info.charging_station_id, "Connection already open");
                    return Ok(());
                }
                self.close_connection().await;
            }

            let url = self.connection_url().await?;
            let template = &self.inner.build.template;
            // One second is withdrawn for the reconnect bookkeeping around the
            // handshake
            let handshake_timeout =
                Duration::from_secs(template.connection_timeout.saturating_sub(1).max(1));
            let (ws, reader) = WsConnection::connect(
                &url,
                info.ocpp_version.sub_protocol(),
                handshake_timeout,
            )
            .await?;
            *self.inner.ws.write().await = Some(Arc::new(ws));

            let engine = self.clone();
            let handle = tokio::spawn(async move { engine.run_reader(reader).await });
            if let Some(previous) = self.inner.reader_handle.lock().await.replace(handle) {
                previous.abort();
            }

            if !self.inner.build.template.auto_register
                || self.registration_status().await != Some(RegistrationStatus::Accepted)
            {
                let engine = self.clone();
                tokio::spawn(async move { engine.run_boot_sequence().await });
            } else {
                let engine = self.clone();
                tokio::spawn(async move { engine.on_registration_accepted().await });
            }
            Ok(())
        })
    }

    pub async fn close_connection(&self) {
        if let Some(ws) = self.inner.ws.write().await.take() {
            if let Err(e) = ws.close().await {
                debug!(error = %e, "Close frame failed");
            }
        }
        if let Some(handle) = self.inner.reader_handle.lock().await.take() {
            handle.abort();
        }
    }

    async fn run_reader(self, mut reader: WsReader) {
        let close_code = loop {
            match reader.next().await {
                Some(Ok(WsMessage::Text(text))) => self.handle_incoming_text(&text).await,
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Some(ws) = &*self.inner.ws.read().await {
                        let _ = ws.send_pong(data).await;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => debug!("Pong received"),
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame
                        .map(|f| u16::from(f.code))
                        .unwrap_or(connection::CLOSE_NO_STATUS);
                }
                Some(Ok(_)) => warn!("Ignoring non-text frame"),
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read error");
                    break 1006;
                }
                None => break connection::CLOSE_NO_STATUS,
            }
        };
        self.on_close(close_code).await;
    }

    async fn on_close(&self, code: u16) {
        let info = self.info().await;
        info!(station = %info.charging_station_id, code, "Connection closed");
        *self.inner.ws.write().await = None;
        self.stop_timers().await;
        self.inner.pending.fail_all(|command| OcppError::ConnectionClosed {
            command: command.to_string(),
        });
        self.emit(StationEvent::Disconnected {
            hash_id: info.hash_id,
            code,
        });

        if connection::is_normal_close(code) {
            // Lifecycle ends here until start() is called again
            self.inner.reconnect_retry_count.store(0, Ordering::SeqCst);
            self.inner.started.store(false, Ordering::SeqCst);
            *self.inner.boot_response.write().await = None;
            return;
        }
        if self.is_started() && !self.inner.stopping.load(Ordering::SeqCst) {
            self.inner
                .ws_connection_restarted
                .store(true, Ordering::SeqCst);
            let engine = self.clone();
            tokio::spawn(async move { engine.reconnect_loop().await });
        }
    }

    async fn reconnect_loop(self) {
        let template = &self.inner.build.template;
        if let Some(atg_config) = &template.automatic_transaction_generator {
            if atg_config.stop_on_connection_failure {
                self.stop_atg(None).await;
            }
        }
        loop {
            if !self.is_started() || self.is_connected().await {
                return;
            }
            let count = self
                .inner
                .reconnect_retry_count
                .fetch_add(1, Ordering::SeqCst)
                + 1;
            let max_retries = template.auto_reconnect_max_retries;
            if max_retries >= 0 && count > max_retries as u32 {
                error!(
                    count,
                    max_retries, "Reconnect retries exhausted, giving up"
                );
                return;
            }
            let delay = if template.reconnect_exponential_delay {
                Duration::from_secs(2u64.saturating_pow(count.min(6)))
            } else {
                Duration::from_secs(template.connection_timeout)
            };
            debug!(count, ?delay, "Scheduling reconnect");
            tokio::time::sleep(delay).await;
            match self.open_connection(true).await {
                Ok(()) => return,
                Err(e) => warn!(count, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    // =========================================================================
    // Inbound traffic
    // =========================================================================

    async fn handle_incoming_text(&self, text: &str) {
        match Frame::from_wire(text) {
            Ok(Frame::Call(call)) => {
                let response = ocpp::dispatch(self, call).await;
                if let Ok(wire) = response.to_wire() {
                    if let Some(ws) = &*self.inner.ws.read().await {
                        if let Err(e) = ws.send_text(wire).await {
                            warn!(error = %e, "Failed to send response frame");
                        }
                    }
                }
            }
            Ok(Frame::CallResult(result)) => {
                if !self
                    .inner
                    .pending
                    .complete(&result.unique_id, result.payload)
                {
                    warn!(
                        unique_id = %result.unique_id,
                        "CALLRESULT for unknown message id"
                    );
                }
            }
            Ok(Frame::CallError(call_error)) => {
                let delivered = self.inner.pending.fail(
                    &call_error.unique_id,
                    OcppError::CallError {
                        code: call_error.error_code,
                        description: call_error.error_description.clone(),
                        details: call_error.error_details.to_string(),
                    },
                );
                if !delivered {
                    warn!(
                        unique_id = %call_error.unique_id,
                        "CALLERROR for unknown message id"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed frame"),
        }
    }

    // =========================================================================
    // Outbound traffic
    // =========================================================================

    fn is_bufferable(&self, action: &str) -> bool {
        if action == "BootNotification" {
            return false;
        }
        if self.inner.build.template.ocpp_strict_compliance
            && matches!(action, "Authorize" | "StartTransaction" | "StopTransaction")
        {
            return false;
        }
        true
    }

    /// Send one typed request and await its typed response
    pub(crate) async fn send_request<T>(
        &self,
        request: T,
        options: SendOptions,
    ) -> OcppResult<T::Response>
    where
        T: OcppAction + Validate,
    {
        if self.inner.build.template.payload_schema_validation {
            request.validate()?;
        }
        let payload = serde_json::to_value(&request)?;
        let value = self
            .send_request_value(T::ACTION_NAME, payload, options)
            .await?;
        serde_json::from_value(value).map_err(|e| OcppError::formation(e.to_string()))
    }

    pub(crate) async fn send_request_value(
        &self,
        action: &str,
        payload: Value,
        options: SendOptions,
    ) -> OcppResult<Value> {
        if !options.bypass_gate && action != "BootNotification" && !self.is_registered().await {
            return Err(OcppError::NotRegistered {
                operation: action.to_string(),
            });
        }

        let frame = Frame::call(action, payload.clone())?;
        let unique_id = frame.unique_id().to_string();
        let wire = frame.to_wire()?;
        let receiver = self.inner.pending.register(&unique_id, action, payload)?;

        let sent = match &*self.inner.ws.read().await {
            Some(ws) => ws.send_text(wire.clone()).await.is_ok(),
            None => false,
        };
        if !sent {
            if options.skip_buffering || !self.is_bufferable(action) {
                self.inner.pending.remove(&unique_id);
                return Err(OcppError::ConnectionClosed {
                    command: action.to_string(),
                });
            }
            let mut buffer = self.inner.message_buffer.lock().await;
            if buffer.len() >= MESSAGE_BUFFER_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back((wire, action.to_string()));
            debug!(action, "Buffered request while disconnected");
        }

        match timeout(OCPP_WS_COMMAND_TIMEOUT, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed {
                command: action.to_string(),
            }),
            Err(_) => {
                self.inner.pending.remove(&unique_id);
                Err(OcppError::RequestTimeout {
                    command: action.to_string(),
                    timeout_secs: OCPP_WS_COMMAND_TIMEOUT.as_secs(),
                })
            }
        }
    }

    async fn flush_message_buffer(&self) {
        let frames: Vec<(String, String)> = {
            let mut buffer = self.inner.message_buffer.lock().await;
            buffer.drain(..).collect()
        };
        if frames.is_empty() {
            return;
        }
        info!(count = frames.len(), "Flushing message buffer");
        for (wire, action) in frames {
            let sent = match &*self.inner.ws.read().await {
                Some(ws) => ws.send_text(wire.clone()).await.is_ok(),
                None => false,
            };
            if !sent {
                warn!(action, "Buffer flush interrupted, re-queueing");
                self.inner.message_buffer.lock().await.push_back((wire, action));
                return;
            }
        }
    }

    // =========================================================================
    // Boot sequence
    // =========================================================================

    async fn run_boot_sequence(self) {
        let template = &self.inner.build.template;
        let max_retries = template.registration_max_retries;
        let mut attempts: i64 = 0;
        loop {
            if !self.is_started() || !self.is_connected().await {
                return;
            }
            attempts += 1;
            match ocpp::send_boot_notification(&self).await {
                Ok(response) => {
                    *self.inner.boot_response.write().await = Some(response.clone());
                    match response.status {
                        RegistrationStatus::Accepted => {
                            self.on_registration_accepted().await;
                            return;
                        }
                        status => {
                            debug!(?status, "Registration not accepted yet");
                            if max_retries >= 0 && attempts > max_retries as i64 {
                                warn!(attempts, "Registration retries exhausted");
                                return;
                            }
                            let pause = if response.interval > 0 {
                                Duration::from_secs(response.interval as u64)
                            } else {
                                DEFAULT_BOOT_RETRY_INTERVAL
                            };
                            tokio::time::sleep(pause).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "BootNotification failed");
                    if max_retries >= 0 && attempts > max_retries as i64 {
                        return;
                    }
                    tokio::time::sleep(DEFAULT_BOOT_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn on_registration_accepted(&self) {
        let info = self.info().await;
        info!(station = %info.charging_station_id, "Registration accepted");

        // (a) the negotiated interval lands in both heartbeat keys
        if let Some(response) = &*self.inner.boot_response.read().await {
            if response.interval > 0 {
                self.inner
                    .config_keys
                    .write()
                    .await
                    .set_value(keys::HEARTBEAT_INTERVAL, &response.interval.to_string());
            }
        }

        // (b) heartbeat, (c) WebSocket ping
        self.restart_heartbeat().await;
        self.restart_ws_ping().await;

        // (d) initial per-connector status notifications
        let connector_ids = self.inner.topology.read().await.connector_ids();
        for connector_id in connector_ids {
            let status = {
                let topology = self.inner.topology.read().await;
                let station_operative = *self.inner.station_availability.read().await
                    == AvailabilityType::Operative;
                topology.connector(connector_id).map(|connector| {
                    connector
                        .boot_status
                        .unwrap_or_else(|| connector.idle_status(station_operative))
                })
            };
            if let Some(status) = status {
                if let Err(e) = self.send_status_notification(connector_id, status).await {
                    warn!(connector_id, error = %e, "Initial status notification failed");
                }
            }
        }

        // (e) a station caught mid-install reports the installed firmware
        if *self.inner.firmware_status.read().await == FirmwareStatus::Installing {
            if let Err(e) = self.set_firmware_status(FirmwareStatus::Installed).await {
                warn!(error = %e, "FirmwareStatusNotification failed");
            }
        }

        // (f) generator configured on → start
        if self
            .inner
            .build
            .template
            .automatic_transaction_generator
            .as_ref()
            .is_some_and(|atg| atg.enable)
        {
            self.start_atg(None).await;
        }

        // (g) reconnects flush what queued up while offline
        if self
            .inner
            .ws_connection_restarted
            .swap(false, Ordering::SeqCst)
        {
            self.inner.reconnect_retry_count.store(0, Ordering::SeqCst);
            self.flush_message_buffer().await;
        }

        self.emit(StationEvent::Registered {
            hash_id: info.hash_id,
        });
    }

    // =========================================================================
    // Timers
    // =========================================================================

    pub(crate) async fn heartbeat_interval(&self) -> u64 {
        self.inner
            .config_keys
            .read()
            .await
            .get_as::<u64>(keys::HEARTBEAT_INTERVAL)
            .filter(|interval| *interval > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL)
    }

    pub(crate) async fn meter_sample_interval(&self) -> u64 {
        self.inner
            .config_keys
            .read()
            .await
            .get_as::<u64>(keys::METER_VALUE_SAMPLE_INTERVAL)
            .filter(|interval| *interval > 0)
            .unwrap_or(60)
    }

    /// (Re)start the heartbeat timer; restarting is idempotent
    pub(crate) async fn restart_heartbeat(&self) {
        let interval_s = self.heartbeat_interval().await;
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = ocpp::send_heartbeat(&engine).await {
                    warn!(error = %e, "Heartbeat failed");
                }
            }
        });
        if let Some(previous) = self.inner.heartbeat_handle.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn restart_ws_ping(&self) {
        let interval_s = self
            .inner
            .config_keys
            .read()
            .await
            .get_as::<u64>(keys::WEB_SOCKET_PING_INTERVAL)
            .unwrap_or(self.inner.build.template.web_socket_ping_interval);
        if interval_s == 0 {
            return;
        }
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(ws) = &*engine.inner.ws.read().await {
                    if let Err(e) = ws.send_ping().await {
                        debug!(error = %e, "Ping failed");
                    }
                }
            }
        });
        if let Some(previous) = self.inner.ping_handle.lock().await.replace(handle) {
            previous.abort();
        }
    }

    // =========================================================================
    // Status notifications
    // =========================================================================

    /// Notify-then-set: the CSMS sees the transition before local state moves.
    /// Illegal transitions are refused.
    pub async fn send_status_notification(
        &self,
        connector_id: u32,
        status: ChargePointStatus,
    ) -> StationResult<()> {
        let info = self.info().await;
        let current = {
            let topology = self.inner.topology.read().await;
            let connector = topology.connector(connector_id).ok_or_else(|| {
                StationError::UnknownConnector {
                    station: info.charging_station_id.clone(),
                    connector_id,
                }
            })?;
            connector.status
        };
        if !is_legal_transition(current, status) {
            warn!(
                connector_id,
                from = ?current,
                to = %status,
                "Refusing illegal status transition"
            );
            return Err(StationError::Ocpp(OcppError::invalid_state(
                format!("StatusNotification({})", status),
                current.map(|s| s.to_string()).unwrap_or_default(),
            )));
        }

        ocpp::send_status_notification(self, connector_id, status).await?;

        if let Some(connector) = self.inner.topology.write().await.connector_mut(connector_id) {
            connector.status = Some(status);
        }
        self.emit(StationEvent::StatusChanged {
            hash_id: info.hash_id,
            connector_id,
            status,
        });
        Ok(())
    }

    pub async fn set_firmware_status(&self, status: FirmwareStatus) -> StationResult<()> {
        *self.inner.firmware_status.write().await = status;
        ocpp::send_firmware_status_notification(self, status).await?;
        self.emit(StationEvent::FirmwareStatusChanged {
            hash_id: self.hash_id().await,
            status,
        });
        Ok(())
    }

    pub async fn firmware_status(&self) -> FirmwareStatus {
        *self.inner.firmware_status.read().await
    }

    // =========================================================================
    // Availability
    // =========================================================================

    pub async fn station_availability(&self) -> AvailabilityType {
        *self.inner.station_availability.read().await
    }

    pub async fn set_station_availability(&self, availability: AvailabilityType) {
        *self.inner.station_availability.write().await = availability;
    }

    pub async fn set_connector_availability(
        &self,
        connector_id: u32,
        availability: AvailabilityType,
    ) -> StationResult<()> {
        let mut topology = self.inner.topology.write().await;
        let connector = topology.connector_mut(connector_id).ok_or_else(|| {
            StationError::UnknownConnector {
                station: String::new(),
                connector_id,
            }
        })?;
        connector.availability = availability;
        Ok(())
    }

    // =========================================================================
    // Authorization
    // =========================================================================

    /// Send Authorize; `Ok(true)` when the CSMS accepted the tag
    pub async fn authorize(&self, connector_id: u32, id_tag: &str) -> StationResult<bool> {
        let response = self
            .send_request(
                AuthorizeRequest {
                    id_tag: id_tag.to_string(),
                },
                SendOptions::default(),
            )
            .await?;
        let accepted = response.id_tag_info.is_accepted();
        if let Some(connector) = self.inner.topology.write().await.connector_mut(connector_id) {
            connector.authorize_id_tag = Some(id_tag.to_string());
            connector.id_tag_authorized = accepted;
        }
        Ok(accepted)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a transaction on a connector. Returns the transaction id on
    /// acceptance, `None` when the CSMS rejected the start.
    pub async fn start_transaction(
        &self,
        connector_id: u32,
        id_tag: Option<String>,
    ) -> StationResult<Option<i32>> {
        let info = self.info().await;
        if !self.is_registered().await {
            return Err(StationError::Ocpp(OcppError::NotRegistered {
                operation: "StartTransaction".to_string(),
            }));
        }
        if self.station_availability().await != AvailabilityType::Operative {
            return Err(StationError::transaction(
                connector_id,
                "station is inoperative",
            ));
        }

        let (status, reservation, already_authorized, meter_start) = {
            let topology = self.inner.topology.read().await;
            let connector = topology.connector(connector_id).ok_or_else(|| {
                StationError::UnknownConnector {
                    station: info.charging_station_id.clone(),
                    connector_id,
                }
            })?;
            if !connector.is_operative() {
                return Err(StationError::transaction(
                    connector_id,
                    "connector is inoperative",
                ));
            }
            if connector.transaction_started {
                return Err(StationError::transaction(
                    connector_id,
                    "a transaction is already running",
                ));
            }
            if topology.sibling_has_transaction(connector_id) {
                return Err(StationError::transaction(
                    connector_id,
                    "a sibling connector on the same EVSE is transacting",
                ));
            }
            let status = connector.status.unwrap_or(ChargePointStatus::Available);
            if !status.accepts_transaction() {
                return Err(StationError::transaction(
                    connector_id,
                    format!("status {} refuses a new transaction", status),
                ));
            }
            (
                status,
                connector.reservation.clone(),
                connector.id_tag_authorized || connector.id_tag_local_authorized,
                connector.energy_active_import_register_value.round() as i32,
            )
        };
        let _ = status;
        let authorize_remote = self
            .inner
            .config_keys
            .read()
            .await
            .get_as::<bool>(keys::AUTHORIZE_REMOTE_TX_REQUESTS)
            .unwrap_or(true);
        let needs_authorize = authorize_remote && !already_authorized;

        let id_tag = match id_tag {
            Some(id_tag) => id_tag,
            None => {
                self.inner
                    .id_tags
                    .next_tag(
                        self.inner.build.template.id_tags_file.as_deref(),
                        self.inner
                            .build
                            .template
                            .automatic_transaction_generator
                            .as_ref()
                            .map(|atg| atg.id_tag_distribution)
                            .unwrap_or_default(),
                        connector_id,
                    )
                    .await
            }
        };

        if needs_authorize && !self.authorize(connector_id, &id_tag).await? {
            debug!(connector_id, %id_tag, "Authorization rejected");
            return Ok(None);
        }

        let reservation_id = reservation.as_ref().map(|r| r.id);
        let response = self
            .send_request(
                StartTransactionRequest {
                    connector_id,
                    id_tag: id_tag.clone(),
                    meter_start,
                    timestamp: Utc::now(),
                    reservation_id,
                },
                SendOptions::default(),
            )
            .await?;

        if !response.id_tag_info.is_accepted() {
            debug!(connector_id, "StartTransaction rejected by CSMS");
            return Ok(None);
        }
        let transaction_id = response.transaction_id;

        {
            let mut topology = self.inner.topology.write().await;
            if let Some(connector) = topology.connector_mut(connector_id) {
                connector.begin_transaction(transaction_id, id_tag.clone());
            }
        }

        if let Some(reservation) = reservation {
            if reservation.id_tag != id_tag {
                warn!(
                    connector_id,
                    reservation_id = reservation.id,
                    "Transaction id tag differs from the reservation's"
                );
            }
            if reservation.is_expired(Utc::now()) {
                warn!(
                    connector_id,
                    reservation_id = reservation.id,
                    "Consuming an already-expired reservation"
                );
            }
            self.remove_reservation(
                reservation.id,
                ReservationTerminationReason::TransactionStarted,
            )
            .await;
        }

        if self.inner.build.template.begin_end_meter_values {
            let register = self.connector_energy_register(connector_id).await;
            let begin_value = meter::transaction_boundary_meter_value(
                register,
                self.inner.build.template.power_unit.divider(),
                ReadingContext::TransactionBegin,
            );
            if let Err(e) = self
                .send_meter_values(connector_id, Some(transaction_id), vec![begin_value])
                .await
            {
                warn!(error = %e, "Transaction.Begin meter value failed");
            }
        }

        if let Err(e) = self
            .send_status_notification(connector_id, ChargePointStatus::Charging)
            .await
        {
            warn!(connector_id, error = %e, "Charging status notification failed");
        }
        self.start_meter_loop(connector_id, transaction_id).await;
        self.emit(StationEvent::TransactionStarted {
            hash_id: info.hash_id,
            connector_id,
            transaction_id,
        });
        Ok(Some(transaction_id))
    }

    /// Stop a transaction by id (or the only running one when `None`)
    pub async fn stop_transaction(
        &self,
        transaction_id: Option<i32>,
        reason: StopReason,
        id_tag: Option<String>,
    ) -> StationResult<()> {
        let info = self.info().await;
        let (connector_id, transaction_id) = {
            let topology = self.inner.topology.read().await;
            let found = topology
                .connector_ids()
                .into_iter()
                .filter_map(|id| topology.connector(id).map(|c| (id, c)))
                .find(|(_, c)| match transaction_id {
                    Some(wanted) => c.transaction_id == Some(wanted),
                    None => c.transaction_started,
                });
            match found {
                Some((connector_id, connector)) => (
                    connector_id,
                    connector.transaction_id.unwrap_or_default(),
                ),
                None => {
                    return Err(StationError::transaction(
                        0,
                        format!("no running transaction matching {:?}", transaction_id),
                    ))
                }
            }
        };

        let template = &self.inner.build.template;
        let register = self.connector_energy_register(connector_id).await;
        let divider = template.power_unit.divider();

        let mut transaction_data = None;
        if template.begin_end_meter_values {
            let end_value = meter::transaction_boundary_meter_value(
                register,
                divider,
                ReadingContext::TransactionEnd,
            );
            if template.ocpp_strict_compliance && !template.out_of_order_end_meter_values {
                if let Err(e) = self
                    .send_meter_values(connector_id, Some(transaction_id), vec![end_value])
                    .await
                {
                    warn!(error = %e, "Transaction.End meter value failed");
                }
            } else {
                transaction_data = Some(vec![end_value]);
            }
        }

        self.stop_meter_loop(connector_id).await;

        let response = self
            .send_request(
                StopTransactionRequest {
                    transaction_id,
                    meter_stop: register.round() as i32,
                    timestamp: Utc::now(),
                    id_tag,
                    reason: Some(reason),
                    transaction_data,
                },
                SendOptions::default(),
            )
            .await?;
        let _ = response;

        let idle_status = {
            let mut topology = self.inner.topology.write().await;
            let station_operative =
                self.station_availability().await == AvailabilityType::Operative;
            match topology.connector_mut(connector_id) {
                Some(connector) => {
                    connector.end_transaction();
                    connector.idle_status(station_operative)
                }
                None => ChargePointStatus::Available,
            }
        };
        if let Err(e) = self.send_status_notification(connector_id, idle_status).await {
            warn!(connector_id, error = %e, "Post-transaction status notification failed");
        }
        self.emit(StationEvent::TransactionStopped {
            hash_id: info.hash_id,
            connector_id,
            transaction_id,
        });
        Ok(())
    }

    pub(crate) async fn connector_energy_register(&self, connector_id: u32) -> f64 {
        self.inner
            .topology
            .read()
            .await
            .connector(connector_id)
            .map(|c| c.energy_active_import_register_value)
            .unwrap_or(0.0)
    }

    /// Send one ad-hoc meter value per listed connector (all when `None`),
    /// the way a TriggerMessage(MeterValues) does
    pub async fn send_triggered_meter_values(
        &self,
        connector_ids: Option<Vec<u32>>,
    ) -> StationResult<()> {
        let ids = match connector_ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => self.inner.topology.read().await.connector_ids(),
        };
        for connector_id in ids {
            let register = self.connector_energy_register(connector_id).await;
            let meter_value = meter::transaction_boundary_meter_value(
                register,
                self.inner.build.template.power_unit.divider(),
                ReadingContext::Trigger,
            );
            let transaction_id = self
                .inner
                .topology
                .read()
                .await
                .connector(connector_id)
                .and_then(|c| c.transaction_id);
            self.send_meter_values(connector_id, transaction_id, vec![meter_value])
                .await?;
        }
        Ok(())
    }

    /// Send a station-initiated DataTransfer
    pub async fn send_data_transfer(
        &self,
        vendor_id: String,
        message_id: Option<String>,
        data: Option<String>,
    ) -> StationResult<fleet_messages::v16::DataTransferResponse> {
        Ok(self
            .send_request(
                fleet_messages::v16::DataTransferRequest {
                    vendor_id,
                    message_id,
                    data,
                },
                SendOptions::default(),
            )
            .await?)
    }

    /// Send a DiagnosticsStatusNotification
    pub async fn send_diagnostics_status(
        &self,
        status: fleet_types::common::DiagnosticsStatus,
    ) -> StationResult<()> {
        self.send_request(
            fleet_messages::v16::DiagnosticsStatusNotificationRequest { status },
            SendOptions::default(),
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn send_meter_values(
        &self,
        connector_id: u32,
        transaction_id: Option<i32>,
        meter_value: Vec<MeterValue>,
    ) -> OcppResult<()> {
        self.send_request(
            MeterValuesRequest {
                connector_id,
                transaction_id,
                meter_value,
            },
            SendOptions::default(),
        )
        .await?;
        Ok(())
    }

    /// Power divider applied to the station maximum to get per-connector
    /// capacity
    pub async fn power_divider(&self) -> f64 {
        let topology = self.inner.topology.read().await;
        if self.inner.build.template.power_shared_by_connectors {
            topology.running_transactions().max(1) as f64
        } else if topology.number_of_evses() > 0 {
            topology.number_of_evses() as f64
        } else {
            topology.number_of_connectors().max(1) as f64
        }
    }

    pub(crate) async fn sampled_measurands(&self) -> Vec<Measurand> {
        let raw = self
            .inner
            .config_keys
            .read()
            .await
            .get(keys::METER_VALUES_SAMPLED_DATA)
            .map(|entry| entry.value.clone())
            .unwrap_or_default();
        raw.split(',')
            .filter_map(|name| match name.trim() {
                "Energy.Active.Import.Register" => Some(Measurand::EnergyActiveImportRegister),
                "Power.Active.Import" => Some(Measurand::PowerActiveImport),
                "Current.Import" => Some(Measurand::CurrentImport),
                "Voltage" => Some(Measurand::Voltage),
                "SoC" => Some(Measurand::StateOfCharge),
                _ => None,
            })
            .collect()
    }

    async fn start_meter_loop(&self, connector_id: u32, transaction_id: i32) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let interval_s = engine.meter_sample_interval().await;
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
            ticker.tick().await;
            let mut soc_percent = 20.0;
            loop {
                ticker.tick().await;
                let still_running = engine
                    .inner
                    .topology
                    .read()
                    .await
                    .connector(connector_id)
                    .map(|c| c.transaction_id == Some(transaction_id))
                    .unwrap_or(false);
                if !still_running {
                    return;
                }

                let info = engine.info().await;
                let template = &engine.inner.build.template;
                let divider = engine.power_divider().await;
                let ctx = MeterContext {
                    phases: info.number_of_phases,
                    current_out_type: info.current_out_type,
                    voltage: info.voltage_out,
                    max_power_w: info.maximum_power / divider,
                    max_amperage: info.maximum_amperage,
                    unit_divider: template.power_unit.divider(),
                    measurands: engine.sampled_measurands().await,
                    line_to_line_voltage: false,
                    clamp_values: template.custom_value_limitation_meter_values,
                    interval: Duration::from_secs(interval_s),
                    soc_percent,
                };
                let register = engine.connector_energy_register(connector_id).await;
                let tick = {
                    let mut rng = rand::thread_rng();
                    meter::synthesize(&mut rng, &ctx, register)
                };
                soc_percent = tick.soc_percent;
                {
                    let mut topology = engine.inner.topology.write().await;
                    if let Some(connector) = topology.connector_mut(connector_id) {
                        connector.energy_active_import_register_value +=
                            tick.energy_increment_wh;
                        connector.transaction_energy_active_import_register_value +=
                            tick.energy_increment_wh;
                    }
                }
                if let Err(e) = engine
                    .send_meter_values(connector_id, Some(transaction_id), vec![tick.meter_value])
                    .await
                {
                    warn!(connector_id, error = %e, "MeterValues failed");
                }
            }
        });
        if let Some(previous) = self
            .inner
            .meter_handles
            .lock()
            .await
            .insert(connector_id, handle)
        {
            previous.abort();
        }
    }

    async fn stop_meter_loop(&self, connector_id: u32) {
        if let Some(handle) = self.inner.meter_handles.lock().await.remove(&connector_id) {
            handle.abort();
        }
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    pub async fn add_reservation(&self, reservation: Reservation) -> StationResult<()> {
        let connector_id = reservation.connector_id.value();
        let replaced = {
            let mut topology = self.inner.topology.write().await;
            let connector = topology.connector_mut(connector_id).ok_or_else(|| {
                StationError::UnknownConnector {
                    station: String::new(),
                    connector_id,
                }
            })?;
            let replaced = connector.reservation.take();
            connector.reservation = Some(reservation);
            replaced
        };
        if let Some(replaced) = replaced {
            debug!(
                reservation_id = replaced.id,
                "Replacing existing reservation"
            );
        }
        let current = self
            .inner
            .topology
            .read()
            .await
            .connector(connector_id)
            .and_then(|c| c.status);
        if current == Some(ChargePointStatus::Available) || current.is_none() {
            if let Err(e) = self
                .send_status_notification(connector_id, ChargePointStatus::Reserved)
                .await
            {
                warn!(connector_id, error = %e, "Reserved status notification failed");
            }
        }
        Ok(())
    }

    /// Remove a reservation. Expired, canceled and replaced reservations all
    /// release a Reserved connector back to Available; a started transaction
    /// consumes the reservation without a status change of its own.
    pub async fn remove_reservation(
        &self,
        reservation_id: i32,
        reason: ReservationTerminationReason,
    ) -> bool {
        let connector_id = {
            let mut topology = self.inner.topology.write().await;
            let found = topology.connector_ids().into_iter().find(|id| {
                topology
                    .connector(*id)
                    .and_then(|c| c.reservation.as_ref())
                    .map(|r| r.id == reservation_id)
                    .unwrap_or(false)
            });
            match found {
                Some(connector_id) => {
                    if let Some(connector) = topology.connector_mut(connector_id) {
                        connector.reservation = None;
                    }
                    connector_id
                }
                None => return false,
            }
        };
        match reason {
            ReservationTerminationReason::Expired
            | ReservationTerminationReason::ReservationCanceled
            | ReservationTerminationReason::ReplaceExisting => {
                let current = self
                    .inner
                    .topology
                    .read()
                    .await
                    .connector(connector_id)
                    .and_then(|c| c.status);
                if current == Some(ChargePointStatus::Reserved) {
                    if let Err(e) = self
                        .send_status_notification(connector_id, ChargePointStatus::Available)
                        .await
                    {
                        warn!(connector_id, error = %e, "Release status notification failed");
                    }
                }
            }
            ReservationTerminationReason::TransactionStarted => {}
        }
        true
    }

    pub async fn reservation_on(&self, connector_id: u32) -> Option<Reservation> {
        self.inner
            .topology
            .read()
            .await
            .connector(connector_id)
            .and_then(|c| c.reservation.clone())
    }

    // =========================================================================
    // ATG
    // =========================================================================

    /// Start the transaction generator on the listed connectors, or every
    /// connector when `None`
    pub async fn start_atg(&self, connector_ids: Option<Vec<u32>>) {
        let Some(config) = self.inner.build.template.automatic_transaction_generator.clone()
        else {
            warn!("No transaction generator configured for this station");
            return;
        };
        let atg = {
            let mut slot = self.inner.atg.write().await;
            match &*slot {
                Some(atg) => Arc::clone(atg),
                None => {
                    let atg = Arc::new(Atg::new(self.clone(), config));
                    *slot = Some(Arc::clone(&atg));
                    atg
                }
            }
        };
        let ids = match connector_ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => self.inner.topology.read().await.connector_ids(),
        };
        atg.start(ids).await;
    }

    /// Cooperatively stop the generator on the listed connectors (all when
    /// `None`)
    pub async fn stop_atg(&self, connector_ids: Option<Vec<u32>>) {
        let atg = self.inner.atg.read().await.clone();
        if let Some(atg) = atg {
            let ids = match connector_ids {
                Some(ids) if !ids.is_empty() => ids,
                _ => self.inner.topology.read().await.connector_ids(),
            };
            atg.stop(ids).await;
        }
    }

    pub async fn atg_statuses(&self) -> BTreeMap<u32, AtgStatus> {
        self.inner.atg_statuses.read().await.clone()
    }

    // =========================================================================
    // Snapshot
    // =========================================================================

    pub async fn snapshot(&self) -> StationSnapshot {
        let info = self.inner.info.read().await.clone();
        let topology = self.inner.topology.read().await;
        let connectors = topology
            .connector_ids()
            .into_iter()
            .filter_map(|id| {
                topology.connector(id).map(|c| ConnectorSnapshot {
                    connector_id: id,
                    status: c.status,
                    availability: c.availability,
                    transaction_id: c.transaction_id,
                })
            })
            .collect();
        StationSnapshot {
            hash_id: info.hash_id,
            charging_station_id: info.charging_station_id,
            started: self.is_started(),
            registration_status: self.registration_status().await,
            ocpp_version: info.ocpp_version,
            supervision_url: self.inner.supervision_url.read().await.to_string(),
            firmware_status: *self.inner.firmware_status.read().await,
            connectors,
        }
    }
}
