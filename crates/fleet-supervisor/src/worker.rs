//! Worker host
//!
//! Hosts a bounded set of station engines. A host subscribes to the control
//! bus, executes the procedures addressed to its stations, answers on the
//! response channel, and keeps the bus registry refreshed from station
//! lifecycle events.

use crate::error::SupervisorResult;
use dashmap::DashMap;
use fleet_control::{BusRequest, BusResponse, ControlBus, ProcedureFailure, ProcedureName, RequestPayload};
use fleet_station::id_tags::IdTagsCache;
use fleet_station::station::{StationBuild, StationEngine, StationEvent};
use fleet_station::StationError;
use fleet_types::common::StopReason;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// One worker host and its station set
pub struct WorkerHost {
    id: usize,
    engines: DashMap<String, StationEngine>,
    bus: Arc<ControlBus>,
    id_tags: Arc<IdTagsCache>,
    event_tx: mpsc::UnboundedSender<StationEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<StationEvent>>>,
    restart_on_error: bool,
    request_handle: Mutex<Option<JoinHandle<()>>>,
    event_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHost {
    pub fn new(
        id: usize,
        bus: Arc<ControlBus>,
        id_tags: Arc<IdTagsCache>,
        restart_on_error: bool,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            engines: DashMap::new(),
            bus,
            id_tags,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            restart_on_error,
            request_handle: Mutex::new(None),
            event_handle: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of hosted stations
    pub fn element_count(&self) -> usize {
        self.engines.len()
    }

    /// Subscribe to the bus and start serving requests and lifecycle events
    pub async fn start(self: Arc<Self>) {
        let host = Arc::clone(&self);
        let requests = self.bus.subscribe();
        let request_handle = tokio::spawn(async move { host.serve_requests(requests).await });
        if let Some(previous) = self.request_handle.lock().await.replace(request_handle) {
            previous.abort();
        }

        if let Some(mut event_rx) = self.event_rx.lock().await.take() {
            let host = Arc::clone(&self);
            let event_handle = tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    host.on_station_event(event).await;
                }
            });
            if let Some(previous) = self.event_handle.lock().await.replace(event_handle) {
                previous.abort();
            }
        }
        info!(worker = self.id, "Worker host started");
    }

    async fn serve_requests(self: Arc<Self>, mut requests: broadcast::Receiver<BusRequest>) {
        loop {
            match requests.recv().await {
                Ok(request) => self.handle_request(request).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(worker = self.id, skipped, "Worker host lagged on the bus");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    if self.restart_on_error {
                        warn!(worker = self.id, "Bus closed, resubscribing");
                        requests = self.bus.subscribe();
                        continue;
                    }
                    error!(worker = self.id, "Bus closed, worker host exits");
                    return;
                }
            }
        }
    }

    /// Create, initialize and start one station on this host
    pub async fn add_station(&self, build: StationBuild) -> SupervisorResult<StationEngine> {
        let engine = StationEngine::new(build, Arc::clone(&self.id_tags), self.event_tx.clone());
        engine.initialize().await?;
        let hash_id = engine.hash_id().await;
        self.refresh_snapshot(&engine).await;
        self.engines.insert(hash_id.clone(), engine.clone());
        if let Err(e) = engine.start().await {
            warn!(worker = self.id, %hash_id, error = %e, "Station failed to start");
        }
        debug!(worker = self.id, %hash_id, "Station added");
        Ok(engine)
    }

    /// Stop every hosted station and the host itself
    pub async fn stop(&self) {
        for entry in self.engines.iter() {
            let engine = entry.value().clone();
            if engine.is_started() {
                if let Err(e) = engine.stop(Some(StopReason::PowerLoss)).await {
                    warn!(worker = self.id, error = %e, "Station stop failed");
                }
            }
            self.bus.unregister_station(entry.key());
        }
        self.engines.clear();
        if let Some(handle) = self.request_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.event_handle.lock().await.take() {
            handle.abort();
        }
        info!(worker = self.id, "Worker host stopped");
    }

    async fn on_station_event(&self, event: StationEvent) {
        let hash_id = match &event {
            StationEvent::Started { hash_id }
            | StationEvent::Stopped { hash_id }
            | StationEvent::Registered { hash_id }
            | StationEvent::Disconnected { hash_id, .. }
            | StationEvent::StatusChanged { hash_id, .. }
            | StationEvent::TransactionStarted { hash_id, .. }
            | StationEvent::TransactionStopped { hash_id, .. }
            | StationEvent::FirmwareStatusChanged { hash_id, .. } => hash_id.clone(),
        };
        if let Some(engine) = self.engines.get(&hash_id).map(|e| e.value().clone()) {
            self.refresh_snapshot(&engine).await;
        }
    }

    async fn refresh_snapshot(&self, engine: &StationEngine) {
        let snapshot = engine.snapshot().await;
        if let Ok(value) = serde_json::to_value(&snapshot) {
            self.bus.register_station(snapshot.hash_id.clone(), value);
        }
    }

    async fn handle_request(&self, request: BusRequest) {
        if request.procedure.is_simulator_wide() {
            return;
        }
        let payload: RequestPayload =
            serde_json::from_value(request.payload.clone()).unwrap_or_default();
        let targets = payload.targets();
        let responder = self.bus.responder();

        let engines: Vec<(String, StationEngine)> = self
            .engines
            .iter()
            .filter(|entry| targets.is_empty() || targets.contains(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (hash_id, engine) in engines {
            let result = execute(&engine, request.procedure, &payload, &request.payload).await;
            if let Err(e) = &result {
                debug!(worker = self.id, %hash_id, error = %e.error_message, "Procedure failed");
            }
            let _ = responder.send(BusResponse {
                uuid: request.uuid,
                hash_id,
                result,
            });
            self.refresh_snapshot(&engine).await;
        }
    }
}

fn failure(
    procedure: ProcedureName,
    request_payload: &Value,
    message: impl Into<String>,
) -> ProcedureFailure {
    ProcedureFailure {
        hash_id: None,
        command: procedure.to_string(),
        request_payload: request_payload.clone(),
        error_message: message.into(),
        error_stack: None,
        error_details: None,
    }
}

fn station_failure(
    procedure: ProcedureName,
    request_payload: &Value,
    error: &StationError,
) -> ProcedureFailure {
    failure(procedure, request_payload, error.to_string())
}

/// Run one station-scoped procedure against an engine
async fn execute(
    engine: &StationEngine,
    procedure: ProcedureName,
    payload: &RequestPayload,
    raw_payload: &Value,
) -> Result<Value, ProcedureFailure> {
    match procedure {
        ProcedureName::StartChargingStation => match engine.start().await {
            Ok(()) => Ok(json!({})),
            Err(e) => Err(station_failure(procedure, raw_payload, &e)),
        },
        ProcedureName::StopChargingStation => match engine.stop(None).await {
            Ok(()) => Ok(json!({})),
            Err(e) => Err(station_failure(procedure, raw_payload, &e)),
        },
        ProcedureName::OpenConnection => match engine.open_connection(true).await {
            Ok(()) => Ok(json!({})),
            Err(e) => Err(station_failure(procedure, raw_payload, &e)),
        },
        ProcedureName::CloseConnection => {
            engine.close_connection().await;
            Ok(json!({}))
        }
        ProcedureName::StartTransaction => {
            let connector_id = payload.connector_id.unwrap_or(1);
            match engine
                .start_transaction(connector_id, payload.id_tag.clone())
                .await
            {
                Ok(Some(transaction_id)) => Ok(json!({"transactionId": transaction_id})),
                Ok(None) => Err(failure(
                    procedure,
                    raw_payload,
                    "Transaction start rejected by the CSMS",
                )),
                Err(e) => Err(station_failure(procedure, raw_payload, &e)),
            }
        }
        ProcedureName::StopTransaction => {
            match engine
                .stop_transaction(payload.transaction_id, StopReason::Local, None)
                .await
            {
                Ok(()) => Ok(json!({})),
                Err(e) => Err(station_failure(procedure, raw_payload, &e)),
            }
        }
        ProcedureName::StartAutomaticTransactionGenerator => {
            engine.start_atg(payload.connector_ids.clone()).await;
            Ok(json!({}))
        }
        ProcedureName::StopAutomaticTransactionGenerator => {
            engine.stop_atg(payload.connector_ids.clone()).await;
            Ok(json!({}))
        }
        ProcedureName::SetSupervisionUrl => {
            let Some(raw_url) = payload.url.clone() else {
                return Err(failure(procedure, raw_payload, "Missing 'url' field"));
            };
            match Url::parse(&raw_url) {
                Ok(url) => {
                    engine.set_supervision_url(url).await;
                    Ok(json!({}))
                }
                Err(e) => Err(failure(procedure, raw_payload, e.to_string())),
            }
        }
        ProcedureName::UpdateStatus | ProcedureName::StatusNotification => {
            let Some(connector_id) = payload.connector_id else {
                return Err(failure(procedure, raw_payload, "Missing 'connectorId' field"));
            };
            let status = match payload
                .status
                .as_ref()
                .map(|raw| serde_json::from_value(Value::String(raw.clone())))
            {
                Some(Ok(status)) => status,
                Some(Err(e)) => return Err(failure(procedure, raw_payload, e.to_string())),
                None => {
                    // Re-notify the current status
                    match engine.snapshot().await.connectors.iter().find_map(|c| {
                        (c.connector_id == connector_id).then_some(c.status)
                    }) {
                        Some(Some(status)) => status,
                        _ => {
                            return Err(failure(
                                procedure,
                                raw_payload,
                                "Connector has no status yet",
                            ))
                        }
                    }
                }
            };
            match engine.send_status_notification(connector_id, status).await {
                Ok(()) => Ok(json!({})),
                Err(e) => Err(station_failure(procedure, raw_payload, &e)),
            }
        }
        ProcedureName::UpdateFirmwareStatus | ProcedureName::FirmwareStatusNotification => {
            let status = match payload.status.as_ref() {
                Some(raw) => match serde_json::from_value(Value::String(raw.clone())) {
                    Ok(status) => status,
                    Err(e) => return Err(failure(procedure, raw_payload, e.to_string())),
                },
                None => engine.firmware_status().await,
            };
            match engine.set_firmware_status(status).await {
                Ok(()) => Ok(json!({})),
                Err(e) => Err(station_failure(procedure, raw_payload, &e)),
            }
        }
        ProcedureName::Authorize => {
            let Some(id_tag) = payload.id_tag.clone() else {
                return Err(failure(procedure, raw_payload, "Missing 'idTag' field"));
            };
            let connector_id = payload.connector_id.unwrap_or(1);
            match engine.authorize(connector_id, &id_tag).await {
                Ok(accepted) => Ok(json!({"authorized": accepted})),
                Err(e) => Err(station_failure(procedure, raw_payload, &e)),
            }
        }
        ProcedureName::BootNotification => {
            match fleet_station::ocpp::send_boot_notification(engine).await {
                Ok(response) => Ok(serde_json::to_value(response).unwrap_or(json!({}))),
                Err(e) => Err(failure(procedure, raw_payload, e.to_string())),
            }
        }
        ProcedureName::Heartbeat => match fleet_station::ocpp::send_heartbeat(engine).await {
            Ok(()) => Ok(json!({})),
            Err(e) => Err(failure(procedure, raw_payload, e.to_string())),
        },
        ProcedureName::MeterValues => {
            match engine
                .send_triggered_meter_values(payload.connector_ids.clone())
                .await
            {
                Ok(()) => Ok(json!({})),
                Err(e) => Err(station_failure(procedure, raw_payload, &e)),
            }
        }
        ProcedureName::DataTransfer => {
            let vendor_id = payload
                .extra
                .get("vendorId")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string());
            let Some(vendor_id) = vendor_id else {
                return Err(failure(procedure, raw_payload, "Missing 'vendorId' field"));
            };
            let message_id = payload
                .extra
                .get("messageId")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string());
            let data = payload
                .extra
                .get("data")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string());
            match engine.send_data_transfer(vendor_id, message_id, data).await {
                Ok(response) => Ok(serde_json::to_value(response).unwrap_or(json!({}))),
                Err(e) => Err(station_failure(procedure, raw_payload, &e)),
            }
        }
        ProcedureName::DiagnosticsStatusNotification => {
            let status = match payload.status.as_ref() {
                Some(raw) => match serde_json::from_value(Value::String(raw.clone())) {
                    Ok(status) => status,
                    Err(e) => return Err(failure(procedure, raw_payload, e.to_string())),
                },
                None => fleet_types::common::DiagnosticsStatus::Idle,
            };
            match engine.send_diagnostics_status(status).await {
                Ok(()) => Ok(json!({})),
                Err(e) => Err(station_failure(procedure, raw_payload, &e)),
            }
        }
        ProcedureName::StartSimulator
        | ProcedureName::StopSimulator
        | ProcedureName::ListChargingStations => {
            Err(failure(procedure, raw_payload, "Simulator-wide procedure"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_station::template::{content_hash, StationTemplate};
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    async fn host_with_station() -> (Arc<WorkerHost>, Arc<ControlBus>, tempfile::TempDir, String)
    {
        let dir = tempfile::tempdir().unwrap();
        let template_json = json!({
            "chargePointModel": "Virtual",
            "chargePointVendor": "FleetSim",
            "power": 22000.0,
            "powerUnit": "W",
            "autoRegister": true,
            "connectors": {"1": {}, "2": {}}
        });
        let bytes = serde_json::to_vec(&template_json).unwrap();
        let template_file = dir.path().join("template.json");
        std::fs::write(&template_file, &bytes).unwrap();
        let template = StationTemplate::from_bytes(&template_file, &bytes).unwrap();

        let bus = Arc::new(ControlBus::with_timeout(Duration::from_millis(500)));
        let host = WorkerHost::new(0, Arc::clone(&bus), Arc::new(IdTagsCache::new()), true);
        Arc::clone(&host).start().await;

        let build = StationBuild {
            template_file,
            template,
            template_hash: content_hash(&bytes),
            index: 1,
            supervision_url: url::Url::parse("ws://127.0.0.1:1/ocpp").unwrap(),
            config_dir: dir.path().join("configs"),
        };
        let engine = host.add_station(build).await.unwrap();
        let hash_id = engine.hash_id().await;
        (host, bus, dir, hash_id)
    }

    #[tokio::test]
    async fn test_station_registered_on_bus() {
        let (host, bus, _dir, hash_id) = host_with_station().await;
        assert_eq!(host.element_count(), 1);
        assert_eq!(bus.fleet_size(), 1);
        let stations = bus.stations();
        assert_eq!(stations[0]["hashId"], hash_id);
        host.stop().await;
        assert_eq!(bus.fleet_size(), 0);
    }

    #[tokio::test]
    async fn test_fanout_reaches_hosted_station() {
        let (host, bus, _dir, hash_id) = host_with_station().await;
        // closeConnection is harmless without a live socket
        let response = bus
            .request(
                ProcedureName::CloseConnection,
                json!({"hashIds": [hash_id.clone()]}),
                vec![hash_id.clone()],
            )
            .await;
        assert_eq!(
            response.status,
            fleet_control::ResponseStatus::Success
        );
        assert_eq!(response.hash_ids_succeeded, vec![hash_id]);
        host.stop().await;
    }

    #[tokio::test]
    async fn test_fanout_ignores_other_targets() {
        let (host, bus, _dir, _hash_id) = host_with_station().await;
        let response = bus
            .request(
                ProcedureName::CloseConnection,
                json!({"hashIds": ["h-unknown"]}),
                vec!["h-unknown".to_string()],
            )
            .await;
        assert_eq!(
            response.status,
            fleet_control::ResponseStatus::Failure
        );
        assert_eq!(response.hash_ids_failed, vec!["h-unknown".to_string()]);
        host.stop().await;
    }

    #[tokio::test]
    async fn test_procedure_failure_carries_command() {
        let (host, bus, _dir, hash_id) = host_with_station().await;
        // Station was auto-started by add_station; starting again must fail
        let response = bus
            .request(
                ProcedureName::StartChargingStation,
                json!({"hashIds": [hash_id.clone()]}),
                vec![hash_id.clone()],
            )
            .await;
        assert_eq!(
            response.status,
            fleet_control::ResponseStatus::Failure
        );
        assert_eq!(response.responses_failed[0].command, "startChargingStation");
        assert_eq!(response.responses_failed[0].hash_id, Some(hash_id));
        host.stop().await;
    }

    #[tokio::test]
    async fn test_missing_field_failures() {
        let (host, bus, _dir, hash_id) = host_with_station().await;
        let response = bus
            .request(
                ProcedureName::SetSupervisionUrl,
                json!({"hashIds": [hash_id.clone()]}),
                vec![hash_id.clone()],
            )
            .await;
        assert_eq!(
            response.status,
            fleet_control::ResponseStatus::Failure
        );
        assert!(response.responses_failed[0]
            .error_message
            .contains("url"));
        host.stop().await;
    }

    #[tokio::test]
    async fn test_set_supervision_url() {
        let (host, bus, _dir, hash_id) = host_with_station().await;
        let response = bus
            .request(
                ProcedureName::SetSupervisionUrl,
                json!({"hashIds": [hash_id.clone()], "url": "ws://csms:9000/ocpp"}),
                vec![hash_id.clone()],
            )
            .await;
        assert_eq!(
            response.status,
            fleet_control::ResponseStatus::Success
        );
        let stations = bus.stations();
        assert_eq!(stations[0]["supervisionUrl"], "ws://csms:9000/ocpp");
        host.stop().await;
    }

    #[tokio::test]
    async fn test_paths_are_distinct_per_index() {
        let dir = tempfile::tempdir().unwrap();
        let template_json = json!({
            "chargePointModel": "Virtual",
            "chargePointVendor": "FleetSim",
            "power": 22000.0,
            "powerUnit": "W",
            "connectors": {"1": {}}
        });
        let bytes = serde_json::to_vec(&template_json).unwrap();
        let template_file: PathBuf = dir.path().join("template.json");
        std::fs::write(&template_file, &bytes).unwrap();
        let template = StationTemplate::from_bytes(&template_file, &bytes).unwrap();

        let bus = Arc::new(ControlBus::new());
        let host = WorkerHost::new(0, Arc::clone(&bus), Arc::new(IdTagsCache::new()), true);
        Arc::clone(&host).start().await;
        for index in 1..=2 {
            let build = StationBuild {
                template_file: template_file.clone(),
                template: template.clone(),
                template_hash: content_hash(&bytes),
                index,
                supervision_url: url::Url::parse("ws://127.0.0.1:1/ocpp").unwrap(),
                config_dir: dir.path().join("configs"),
            };
            host.add_station(build).await.unwrap();
        }
        assert_eq!(host.element_count(), 2);
        assert_eq!(bus.fleet_size(), 2);
        host.stop().await;
    }
}
