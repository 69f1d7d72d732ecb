//! Control bus
//!
//! Typed in-process bus between the UI server and every worker host.
//! Requests fan out on a broadcast channel; each targeted station answers on
//! the shared response channel, and the aggregator collects responses by
//! correlation id until the expected count is reached or the fan-out timeout
//! fires. Stations that never answer are reported failed.

use crate::procedures::{ProcedureName, ResponseStatus};
use crate::FANOUT_TIMEOUT;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Request broadcast to every worker host
#[derive(Debug, Clone)]
pub struct BusRequest {
    pub uuid: Uuid,
    pub procedure: ProcedureName,
    pub payload: Value,
}

/// Failure detail carried in a FAILURE response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_id: Option<String>,
    pub command: String,
    pub request_payload: Value,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
}

/// One station's answer to a fan-out request
#[derive(Debug, Clone)]
pub struct BusResponse {
    pub uuid: Uuid,
    pub hash_id: String,
    pub result: Result<Value, ProcedureFailure>,
}

/// Aggregate of every response to one fan-out request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash_ids_succeeded: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash_ids_failed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub responses_failed: Vec<ProcedureFailure>,
}

impl AggregatedResponse {
    pub fn success() -> Self {
        Self {
            status: ResponseStatus::Success,
            hash_ids_succeeded: Vec::new(),
            hash_ids_failed: Vec::new(),
            responses_failed: Vec::new(),
        }
    }
}

struct PendingAggregation {
    expected: usize,
    targets: Vec<String>,
    succeeded: Vec<String>,
    failed: Vec<String>,
    failures: Vec<ProcedureFailure>,
    done_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

/// The in-process control bus
pub struct ControlBus {
    request_tx: broadcast::Sender<BusRequest>,
    response_tx: mpsc::UnboundedSender<BusResponse>,
    pending: Arc<DashMap<Uuid, Mutex<PendingAggregation>>>,
    /// Station snapshots registered by the worker hosts; backs the
    /// UI-server-local station listing and the fleet-wide expected count
    registry: DashMap<String, Value>,
    fanout_timeout: Duration,
}

impl Default for ControlBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBus {
    pub fn new() -> Self {
        Self::with_timeout(FANOUT_TIMEOUT)
    }

    pub fn with_timeout(fanout_timeout: Duration) -> Self {
        let (request_tx, _) = broadcast::channel(256);
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let pending: Arc<DashMap<Uuid, Mutex<PendingAggregation>>> = Arc::new(DashMap::new());

        let router_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            Self::route_responses(response_rx, router_pending).await;
        });

        Self {
            request_tx,
            response_tx,
            pending,
            registry: DashMap::new(),
            fanout_timeout,
        }
    }

    /// Subscribe a worker host to the request stream
    pub fn subscribe(&self) -> broadcast::Receiver<BusRequest> {
        self.request_tx.subscribe()
    }

    /// Sender worker hosts use to answer requests
    pub fn responder(&self) -> mpsc::UnboundedSender<BusResponse> {
        self.response_tx.clone()
    }

    /// Record (or refresh) a station snapshot
    pub fn register_station(&self, hash_id: String, snapshot: Value) {
        self.registry.insert(hash_id, snapshot);
    }

    pub fn unregister_station(&self, hash_id: &str) {
        self.registry.remove(hash_id);
    }

    /// Snapshots of every registered station
    pub fn stations(&self) -> Vec<Value> {
        self.registry.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn fleet_size(&self) -> usize {
        self.registry.len()
    }

    async fn route_responses(
        mut response_rx: mpsc::UnboundedReceiver<BusResponse>,
        pending: Arc<DashMap<Uuid, Mutex<PendingAggregation>>>,
    ) {
        while let Some(response) = response_rx.recv().await {
            let Some(entry) = pending.get(&response.uuid) else {
                debug!(uuid = %response.uuid, "Late response dropped");
                continue;
            };
            let mut aggregation = entry.lock().await;
            match response.result {
                Ok(_) => aggregation.succeeded.push(response.hash_id),
                Err(mut failure) => {
                    failure.hash_id = Some(response.hash_id.clone());
                    aggregation.failed.push(response.hash_id);
                    aggregation.failures.push(failure);
                }
            }
            if aggregation.succeeded.len() + aggregation.failed.len() >= aggregation.expected {
                if let Some(done_tx) = aggregation.done_tx.take() {
                    let _ = done_tx.send(());
                }
            }
        }
    }

    /// Fan a request out and aggregate the responses. `targets` empty means
    /// the whole fleet; the expected response count is `|targets|` or the
    /// fleet size.
    pub async fn request(
        &self,
        procedure: ProcedureName,
        payload: Value,
        targets: Vec<String>,
    ) -> AggregatedResponse {
        let uuid = Uuid::new_v4();
        let expected = if targets.is_empty() {
            self.fleet_size()
        } else {
            targets.len()
        };
        if expected == 0 {
            debug!(%procedure, "No stations to address");
            return AggregatedResponse::success();
        }

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        self.pending.insert(
            uuid,
            Mutex::new(PendingAggregation {
                expected,
                targets: targets.clone(),
                succeeded: Vec::new(),
                failed: Vec::new(),
                failures: Vec::new(),
                done_tx: Some(done_tx),
            }),
        );

        let request = BusRequest {
            uuid,
            procedure,
            payload: payload.clone(),
        };
        if self.request_tx.send(request).is_err() {
            warn!(%procedure, "No worker hosts subscribed");
        }

        let _ = tokio::time::timeout(self.fanout_timeout, done_rx).await;

        let (_, aggregation) = self
            .pending
            .remove(&uuid)
            .expect("aggregation entry present until removal");
        let mut aggregation = aggregation.into_inner();

        // Targets that never answered count as failures
        let answered: Vec<&String> = aggregation
            .succeeded
            .iter()
            .chain(aggregation.failed.iter())
            .collect();
        let missing: Vec<String> = aggregation
            .targets
            .iter()
            .filter(|target| !answered.contains(target))
            .cloned()
            .collect();
        for hash_id in missing {
            aggregation.failures.push(ProcedureFailure {
                hash_id: Some(hash_id.clone()),
                command: procedure.to_string(),
                request_payload: payload.clone(),
                error_message: "No response within the fan-out timeout".to_string(),
                error_stack: None,
                error_details: None,
            });
            aggregation.failed.push(hash_id);
        }

        AggregatedResponse {
            status: if aggregation.failed.is_empty() {
                ResponseStatus::Success
            } else {
                ResponseStatus::Failure
            },
            hash_ids_succeeded: aggregation.succeeded,
            hash_ids_failed: aggregation.failed,
            responses_failed: aggregation.failures,
        }
    }
}
