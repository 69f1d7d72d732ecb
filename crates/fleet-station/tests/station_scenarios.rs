//! End-to-end station scenarios against an in-process mock CSMS
//!
//! The harness accepts OCPP-J WebSocket connections, answers CALL frames
//! from a programmable behavior function, records everything it receives,
//! and can kill live connections with an arbitrary close code.

use fleet_station::id_tags::IdTagsCache;
use fleet_station::station::{StationBuild, StationEngine};
use fleet_station::template::{content_hash, StationTemplate};
use fleet_types::common::StopReason;
use fleet_types::v16::ChargePointStatus;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Poll an async condition until it holds or the deadline passes
macro_rules! wait_until {
    ($what:expr, $timeout:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + $timeout;
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("Timed out waiting for {}", $what);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }};
}

type Behavior = Arc<dyn Fn(&str, &Value, usize) -> Value + Send + Sync>;

struct MockCsms {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<(String, Value)>>>,
    connections: Arc<AtomicUsize>,
    kill_tx: broadcast::Sender<u16>,
}

impl MockCsms {
    async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (kill_tx, _) = broadcast::channel(4);
        let action_counts: Arc<Mutex<HashMap<String, usize>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let accept_received = Arc::clone(&received);
        let accept_connections = Arc::clone(&connections);
        let accept_kill = kill_tx.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                accept_connections.fetch_add(1, Ordering::SeqCst);
                let received = Arc::clone(&accept_received);
                let behavior = Arc::clone(&behavior);
                let counts = Arc::clone(&action_counts);
                let mut kill_rx = accept_kill.subscribe();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    loop {
                        tokio::select! {
                            message = ws.next() => {
                                let Some(Ok(message)) = message else { return };
                                let Message::Text(text) = message else { continue };
                                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                                    continue;
                                };
                                let parts = frame.as_array().cloned().unwrap_or_default();
                                if parts.len() != 4 || parts[0] != 2 {
                                    continue;
                                }
                                let unique_id = parts[1].as_str().unwrap_or_default().to_string();
                                let action = parts[2].as_str().unwrap_or_default().to_string();
                                let payload = parts[3].clone();
                                received.lock().await.push((action.clone(), payload.clone()));
                                let attempt = {
                                    let mut counts = counts.lock().await;
                                    let counter = counts.entry(action.clone()).or_insert(0);
                                    *counter += 1;
                                    *counter
                                };
                                let response = behavior(&action, &payload, attempt);
                                let result = json!([3, unique_id, response]);
                                if ws.send(Message::Text(result.to_string())).await.is_err() {
                                    return;
                                }
                            }
                            code = kill_rx.recv() => {
                                if let Ok(code) = code {
                                    let _ = ws
                                        .send(Message::Close(Some(CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: "killed".into(),
                                        })))
                                        .await;
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            received,
            connections,
            kill_tx,
        }
    }

    fn url(&self) -> Url {
        Url::parse(&format!("ws://{}/ocpp", self.addr)).unwrap()
    }

    async fn frames_of(&self, action: &str) -> Vec<Value> {
        self.received
            .lock()
            .await
            .iter()
            .filter(|(received_action, _)| received_action == action)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    async fn all_actions(&self) -> Vec<String> {
        self.received
            .lock()
            .await
            .iter()
            .map(|(action, _)| action.clone())
            .collect()
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn kill_connections(&self, code: u16) {
        let _ = self.kill_tx.send(code);
    }
}

fn accepting_behavior() -> Behavior {
    Arc::new(|action, _payload, _attempt| match action {
        "BootNotification" => json!({
            "currentTime": chrono::Utc::now().to_rfc3339(),
            "interval": 1,
            "status": "Accepted"
        }),
        "Heartbeat" => json!({"currentTime": chrono::Utc::now().to_rfc3339()}),
        "Authorize" => json!({"idTagInfo": {"status": "Accepted"}}),
        "StartTransaction" => json!({
            "idTagInfo": {"status": "Accepted"},
            "transactionId": 7
        }),
        _ => json!({}),
    })
}

fn station(csms_url: Url, template_overrides: Value) -> (StationEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut template_json = json!({
        "chargePointModel": "Virtual",
        "chargePointVendor": "FleetSim",
        "power": 22000.0,
        "powerUnit": "W",
        "connectors": {"0": {}, "1": {}, "2": {}}
    });
    if let (Some(base), Some(overrides)) =
        (template_json.as_object_mut(), template_overrides.as_object())
    {
        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }
    }
    let bytes = serde_json::to_vec(&template_json).unwrap();
    let template_file = dir.path().join("template.json");
    std::fs::write(&template_file, &bytes).unwrap();
    let template = StationTemplate::from_bytes(&template_file, &bytes).unwrap();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let engine = StationEngine::new(
        StationBuild {
            template_file,
            template,
            template_hash: content_hash(&bytes),
            index: 1,
            supervision_url: csms_url,
            config_dir: dir.path().join("configs"),
        },
        Arc::new(IdTagsCache::new()),
        event_tx,
    );
    (engine, dir)
}

async fn connector_status(engine: &StationEngine, connector_id: u32) -> Option<ChargePointStatus> {
    engine
        .snapshot()
        .await
        .connectors
        .into_iter()
        .find(|c| c.connector_id == connector_id)
        .and_then(|c| c.status)
}

#[tokio::test]
async fn boot_accept_sequences_status_and_heartbeat() {
    let csms = MockCsms::spawn(accepting_behavior()).await;
    let (engine, _dir) = station(csms.url(), json!({}));
    engine.initialize().await.unwrap();
    engine.start().await.unwrap();

    wait_until!(
        "registration",
        Duration::from_secs(5),
        engine.is_registered().await
    );

    // (a) both per-connector status notifications go out as Available
    wait_until!(
        "status notifications",
        Duration::from_secs(5),
        csms.frames_of("StatusNotification").await.len() >= 2
    );
    let statuses = csms.frames_of("StatusNotification").await;
    let connector_ids: Vec<i64> = statuses
        .iter()
        .filter_map(|payload| payload["connectorId"].as_i64())
        .collect();
    assert!(connector_ids.contains(&1));
    assert!(connector_ids.contains(&2));
    for payload in &statuses {
        assert_eq!(payload["status"], "Available");
        assert_eq!(payload["errorCode"], "NoError");
    }

    // (b) the negotiated interval lands in the heartbeat key
    let snapshot = engine.snapshot().await;
    assert!(snapshot.registration_status.is_some());

    // (c) a heartbeat follows within the interval bound
    wait_until!(
        "heartbeat",
        Duration::from_secs(5),
        !csms.frames_of("Heartbeat").await.is_empty()
    );

    engine.stop(None).await.unwrap();
}

#[tokio::test]
async fn boot_pending_retries_without_other_traffic() {
    let behavior: Behavior = Arc::new(|action, _payload, attempt| match action {
        "BootNotification" if attempt <= 3 => json!({
            "currentTime": chrono::Utc::now().to_rfc3339(),
            "interval": 1,
            "status": "Pending"
        }),
        "BootNotification" => json!({
            "currentTime": chrono::Utc::now().to_rfc3339(),
            "interval": 10,
            "status": "Accepted"
        }),
        "Heartbeat" => json!({"currentTime": chrono::Utc::now().to_rfc3339()}),
        _ => json!({}),
    });
    let csms = MockCsms::spawn(behavior).await;
    let (engine, _dir) = station(csms.url(), json!({}));
    engine.initialize().await.unwrap();
    engine.start().await.unwrap();

    wait_until!(
        "registration",
        Duration::from_secs(15),
        engine.is_registered().await
    );

    let boots = csms.frames_of("BootNotification").await;
    assert!(boots.len() >= 4, "expected >= 4 boot attempts, saw {}", boots.len());

    // Nothing but BootNotification went out before the acceptance
    let actions = csms.all_actions().await;
    let first_non_boot = actions.iter().position(|action| action != "BootNotification");
    if let Some(position) = first_non_boot {
        assert!(position >= 4, "non-boot traffic before acceptance: {:?}", actions);
    }

    engine.stop(None).await.unwrap();
}

#[tokio::test]
async fn transaction_happy_path() {
    let csms = MockCsms::spawn(accepting_behavior()).await;
    let (engine, _dir) = station(
        csms.url(),
        json!({
            "configuration": {
                "configurationKey": [
                    {"key": "MeterValueSampleInterval", "value": "1"},
                    {"key": "MeterValuesSampledData",
                     "value": "Energy.Active.Import.Register,Power.Active.Import,Voltage"}
                ]
            }
        }),
    );
    engine.initialize().await.unwrap();
    engine.start().await.unwrap();
    wait_until!(
        "registration",
        Duration::from_secs(5),
        engine.is_registered().await
    );

    let transaction_id = engine
        .start_transaction(1, Some("TAG-1".to_string()))
        .await
        .unwrap();
    assert_eq!(transaction_id, Some(7));
    assert_eq!(
        connector_status(&engine, 1).await,
        Some(ChargePointStatus::Charging)
    );

    // Periodic meter values carry the transaction id and the configured
    // measurands
    wait_until!(
        "meter values",
        Duration::from_secs(10),
        !csms.frames_of("MeterValues").await.is_empty()
    );
    let meter_values = csms.frames_of("MeterValues").await;
    let sample = &meter_values[0];
    assert_eq!(sample["transactionId"], 7);
    assert_eq!(sample["connectorId"], 1);
    let measurands: Vec<String> = sample["meterValue"][0]["sampledValue"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|s| s["measurand"].as_str().map(|m| m.to_string()))
        .collect();
    assert!(measurands.contains(&"Energy.Active.Import.Register".to_string()));
    assert!(measurands.contains(&"Power.Active.Import".to_string()));
    assert!(measurands.contains(&"Voltage".to_string()));

    engine
        .stop_transaction(Some(7), StopReason::Local, None)
        .await
        .unwrap();
    let stops = csms.frames_of("StopTransaction").await;
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0]["transactionId"], 7);
    assert!(stops[0]["meterStop"].as_i64().unwrap() >= 0);
    assert_eq!(stops[0]["reason"], "Local");
    assert_eq!(
        connector_status(&engine, 1).await,
        Some(ChargePointStatus::Available)
    );

    // The meter timer is gone: no further MeterValues arrive
    let settled = csms.frames_of("MeterValues").await.len();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(csms.frames_of("MeterValues").await.len(), settled);

    engine.stop(None).await.unwrap();
}

#[tokio::test]
async fn authorize_precedes_start_transaction() {
    let csms = MockCsms::spawn(accepting_behavior()).await;
    let (engine, _dir) = station(csms.url(), json!({}));
    engine.initialize().await.unwrap();
    engine.start().await.unwrap();
    wait_until!(
        "registration",
        Duration::from_secs(5),
        engine.is_registered().await
    );

    // AuthorizeRemoteTxRequests defaults to true and the tag is not locally
    // authorized, so Authorize must go out first
    let transaction_id = engine
        .start_transaction(1, Some("TAG-2".to_string()))
        .await
        .unwrap();
    assert!(transaction_id.is_some());

    let actions = csms.all_actions().await;
    let authorize_at = actions.iter().position(|action| action == "Authorize");
    let start_at = actions.iter().position(|action| action == "StartTransaction");
    assert!(authorize_at.is_some(), "no Authorize frame: {:?}", actions);
    assert!(authorize_at.unwrap() < start_at.unwrap());

    let authorizes = csms.frames_of("Authorize").await;
    assert_eq!(authorizes[0]["idTag"], "TAG-2");

    engine.stop(None).await.unwrap();
}

#[tokio::test]
async fn abnormal_close_triggers_reconnect_and_fresh_boot() {
    let csms = MockCsms::spawn(accepting_behavior()).await;
    let (engine, _dir) = station(
        csms.url(),
        json!({
            "connectionTimeout": 2,
            "autoReconnectMaxRetries": -1
        }),
    );
    engine.initialize().await.unwrap();
    engine.start().await.unwrap();
    wait_until!(
        "registration",
        Duration::from_secs(5),
        engine.is_registered().await
    );
    assert_eq!(csms.connection_count(), 1);

    // Kill the socket with a non-normal code: the station must come back
    csms.kill_connections(1011);
    wait_until!(
        "reconnect",
        Duration::from_secs(10),
        csms.connection_count() >= 2
    );

    let heartbeats_before = csms.frames_of("Heartbeat").await.len();
    wait_until!(
        "fresh boot",
        Duration::from_secs(10),
        csms.frames_of("BootNotification").await.len() >= 2
    );
    wait_until!(
        "post-reconnect traffic",
        Duration::from_secs(10),
        csms.frames_of("Heartbeat").await.len() > heartbeats_before
    );

    engine.stop(None).await.unwrap();
}

#[tokio::test]
async fn normal_close_does_not_reconnect() {
    let csms = MockCsms::spawn(accepting_behavior()).await;
    let (engine, _dir) = station(csms.url(), json!({"connectionTimeout": 1}));
    engine.initialize().await.unwrap();
    engine.start().await.unwrap();
    wait_until!(
        "registration",
        Duration::from_secs(5),
        engine.is_registered().await
    );

    csms.kill_connections(1000);
    wait_until!("lifecycle end", Duration::from_secs(5), !engine.is_started());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(csms.connection_count(), 1, "normal close must end the lifecycle");
    assert!(!engine.is_registered().await);
}

#[tokio::test]
async fn registration_max_retries_zero_boots_once() {
    let behavior: Behavior = Arc::new(|action, _payload, _attempt| match action {
        "BootNotification" => json!({
            "currentTime": chrono::Utc::now().to_rfc3339(),
            "interval": 1,
            "status": "Rejected"
        }),
        _ => json!({}),
    });
    let csms = MockCsms::spawn(behavior).await;
    let (engine, _dir) = station(csms.url(), json!({"registrationMaxRetries": 0}));
    engine.initialize().await.unwrap();
    engine.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(csms.frames_of("BootNotification").await.len(), 1);
    assert!(!engine.is_registered().await);

    engine.stop(None).await.unwrap();
}
