//! Automatic transaction generator
//!
//! One cooperative task per connector, gated by the per-connector `start`
//! flag. Each pass sleeps a random delay, draws against
//! `probability_of_start`, and either runs a full authorize/start/sleep/stop
//! transaction cycle or bumps the skip counters. The generator horizon is
//! `start_date + stop_after_hours`, shortened by time already spent in
//! previous runs so a restart resumes rather than extends it.

use crate::station::StationEngine;
use crate::template::AtgConfig;
use chrono::{DateTime, Utc};
use fleet_types::common::{AvailabilityType, StopReason};
use fleet_types::v16::ChargePointStatus;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-connector generator state and counters, persisted between runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AtgStatus {
    /// Gate flag; the loop exits when this drops to false
    pub start: bool,
    pub authorize_requests: u64,
    pub accepted_authorize_requests: u64,
    pub rejected_authorize_requests: u64,
    pub start_transaction_requests: u64,
    pub accepted_start_transaction_requests: u64,
    pub rejected_start_transaction_requests: u64,
    pub stop_transaction_requests: u64,
    pub accepted_stop_transaction_requests: u64,
    pub rejected_stop_transaction_requests: u64,
    pub skipped_consecutive_transactions: u64,
    pub skipped_transactions: u64,
    pub start_date: Option<DateTime<Utc>>,
    pub last_run_date: Option<DateTime<Utc>>,
    pub stop_date: Option<DateTime<Utc>>,
    pub stopped_date: Option<DateTime<Utc>>,
    /// Time consumed by previous runs, subtracted from the horizon
    pub previous_run_duration_ms: u64,
}

/// The generator bound to one station engine
pub struct Atg {
    engine: StationEngine,
    config: AtgConfig,
    handles: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl Atg {
    pub fn new(engine: StationEngine, config: AtgConfig) -> Self {
        Self {
            engine,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Start the per-connector loops for the given connectors. Connectors
    /// already running are left alone.
    pub async fn start(&self, connector_ids: Vec<u32>) {
        for connector_id in connector_ids {
            let mut handles = self.handles.lock().await;
            if handles
                .get(&connector_id)
                .map(|handle| !handle.is_finished())
                .unwrap_or(false)
            {
                debug!(connector_id, "Generator already running");
                continue;
            }

            {
                let mut statuses = self.engine.inner().atg_statuses.write().await;
                let status = statuses.entry(connector_id).or_default();
                status.start = true;
                let now = Utc::now();
                status.start_date = Some(now);
                let horizon_ms = (self.config.stop_after_hours * 3_600_000.0) as i64
                    - status.previous_run_duration_ms as i64;
                status.stop_date =
                    Some(now + chrono::Duration::milliseconds(horizon_ms.max(0)));
                status.stopped_date = None;
            }

            let engine = self.engine.clone();
            let config = self.config.clone();
            let handle =
                tokio::spawn(async move { run_connector(engine, config, connector_id).await });
            handles.insert(connector_id, handle);
            info!(connector_id, "Transaction generator started");
        }
    }

    /// Cooperative stop: drop the gate flags and let the loops exit at their
    /// next check
    pub async fn stop(&self, connector_ids: Vec<u32>) {
        let mut statuses = self.engine.inner().atg_statuses.write().await;
        for connector_id in connector_ids {
            if let Some(status) = statuses.get_mut(&connector_id) {
                if status.start {
                    status.start = false;
                    info!(connector_id, "Transaction generator stop requested");
                }
            }
        }
    }
}

async fn gate_open(engine: &StationEngine, connector_id: u32) -> bool {
    engine
        .inner()
        .atg_statuses
        .read()
        .await
        .get(&connector_id)
        .map(|status| status.start)
        .unwrap_or(false)
}

/// Close out the status record when a loop exits
async fn finish_run(engine: &StationEngine, connector_id: u32) {
    let mut statuses = engine.inner().atg_statuses.write().await;
    if let Some(status) = statuses.get_mut(&connector_id) {
        status.start = false;
        let now = Utc::now();
        if let Some(start_date) = status.start_date {
            status.previous_run_duration_ms += (now - start_date).num_milliseconds().max(0) as u64;
        }
        status.stopped_date = Some(now);
    }
    drop(statuses);
    if engine
        .template()
        .automatic_transaction_generator_persistent_configuration
    {
        if let Err(e) = engine.persist_configuration().await {
            warn!(connector_id, error = %e, "Failed to persist generator counters");
        }
    }
    info!(connector_id, "Transaction generator stopped");
}

async fn run_connector(engine: StationEngine, config: AtgConfig, connector_id: u32) {
    loop {
        if !gate_open(&engine, connector_id).await {
            break;
        }

        // Horizon check
        let past_horizon = engine
            .inner()
            .atg_statuses
            .read()
            .await
            .get(&connector_id)
            .and_then(|status| status.stop_date)
            .map(|stop_date| Utc::now() > stop_date)
            .unwrap_or(false);
        if past_horizon {
            debug!(connector_id, "Generator horizon reached");
            break;
        }

        // Station/connector guards
        let guards_ok = engine.is_registered().await
            && engine.station_availability().await == AvailabilityType::Operative
            && {
                let topology = engine.inner().topology.read().await;
                topology
                    .connector(connector_id)
                    .map(|connector| {
                        connector.is_operative()
                            && connector.status != Some(ChargePointStatus::Unavailable)
                    })
                    .unwrap_or(false)
            };
        if !guards_ok {
            debug!(connector_id, "Generator guards failed");
            break;
        }

        let wait_ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(
                config.min_delay_between_two_transactions * 1000
                    ..=config.max_delay_between_two_transactions * 1000,
            )
        };
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        if !gate_open(&engine, connector_id).await {
            break;
        }

        let draw: f64 = {
            let mut rng = rand::thread_rng();
            rng.gen()
        };
        if draw < config.probability_of_start {
            {
                let mut statuses = engine.inner().atg_statuses.write().await;
                if let Some(status) = statuses.get_mut(&connector_id) {
                    status.skipped_consecutive_transactions = 0;
                }
            }
            run_transaction_cycle(&engine, &config, connector_id).await;
        } else {
            let mut statuses = engine.inner().atg_statuses.write().await;
            if let Some(status) = statuses.get_mut(&connector_id) {
                status.skipped_consecutive_transactions += 1;
                status.skipped_transactions += 1;
                debug!(
                    connector_id,
                    skipped = status.skipped_transactions,
                    "Transaction start skipped"
                );
            }
        }

        let mut statuses = engine.inner().atg_statuses.write().await;
        if let Some(status) = statuses.get_mut(&connector_id) {
            status.last_run_date = Some(Utc::now());
        }
    }
    finish_run(&engine, connector_id).await;
}

async fn run_transaction_cycle(engine: &StationEngine, config: &AtgConfig, connector_id: u32) {
    let id_tag = engine
        .inner()
        .id_tags
        .next_tag(
            engine.template().id_tags_file.as_deref(),
            config.id_tag_distribution,
            connector_id,
        )
        .await;

    if config.require_authorize {
        {
            let mut statuses = engine.inner().atg_statuses.write().await;
            if let Some(status) = statuses.get_mut(&connector_id) {
                status.authorize_requests += 1;
            }
        }
        let authorized = engine.authorize(connector_id, &id_tag).await;
        let mut statuses = engine.inner().atg_statuses.write().await;
        match authorized {
            Ok(true) => {
                if let Some(status) = statuses.get_mut(&connector_id) {
                    status.accepted_authorize_requests += 1;
                }
            }
            Ok(false) | Err(_) => {
                if let Some(status) = statuses.get_mut(&connector_id) {
                    status.rejected_authorize_requests += 1;
                }
                return;
            }
        }
    }

    {
        let mut statuses = engine.inner().atg_statuses.write().await;
        if let Some(status) = statuses.get_mut(&connector_id) {
            status.start_transaction_requests += 1;
        }
    }
    let transaction_id = match engine.start_transaction(connector_id, Some(id_tag)).await {
        Ok(Some(transaction_id)) => {
            let mut statuses = engine.inner().atg_statuses.write().await;
            if let Some(status) = statuses.get_mut(&connector_id) {
                status.accepted_start_transaction_requests += 1;
            }
            transaction_id
        }
        Ok(None) => {
            let mut statuses = engine.inner().atg_statuses.write().await;
            if let Some(status) = statuses.get_mut(&connector_id) {
                status.rejected_start_transaction_requests += 1;
            }
            return;
        }
        Err(e) => {
            warn!(connector_id, error = %e, "Generator start failed");
            let mut statuses = engine.inner().atg_statuses.write().await;
            if let Some(status) = statuses.get_mut(&connector_id) {
                status.rejected_start_transaction_requests += 1;
            }
            return;
        }
    };

    let duration_ms = {
        let mut rng = rand::thread_rng();
        rng.gen_range(config.min_duration * 1000..=config.max_duration * 1000)
    };
    debug!(connector_id, transaction_id, duration_ms, "Charging");
    tokio::time::sleep(Duration::from_millis(duration_ms)).await;

    {
        let mut statuses = engine.inner().atg_statuses.write().await;
        if let Some(status) = statuses.get_mut(&connector_id) {
            status.stop_transaction_requests += 1;
        }
    }
    match engine
        .stop_transaction(Some(transaction_id), StopReason::Local, None)
        .await
    {
        Ok(()) => {
            let mut statuses = engine.inner().atg_statuses.write().await;
            if let Some(status) = statuses.get_mut(&connector_id) {
                status.accepted_stop_transaction_requests += 1;
            }
        }
        Err(e) => {
            warn!(connector_id, transaction_id, error = %e, "Generator stop failed");
            let mut statuses = engine.inner().atg_statuses.write().await;
            if let Some(status) = statuses.get_mut(&connector_id) {
                status.rejected_stop_transaction_requests += 1;
            }
        }
    }
}
