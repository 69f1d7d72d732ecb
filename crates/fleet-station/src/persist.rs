//! Persisted station configuration
//!
//! Station state that survives restarts: the station info block, the OCPP
//! configuration keys, the generator configuration and counters, and the
//! connector (or EVSE) status records. The file carries a hash of the
//! canonical `{stationInfo, configurationKey, automaticTransactionGenerator}`
//! JSON; rewrites are skipped while the hash is unchanged and writes go
//! through a temp file plus rename under a per-file async lock.

use crate::atg::AtgStatus;
use crate::config_keys::ConfigurationKey;
use crate::connectors::{ConnectorState, EvseState, Topology};
use crate::error::{StationError, StationResult};
use crate::station::StationInfo;
use crate::template::AtgConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-file write locks shared by every station on the host
fn file_locks() -> &'static DashMap<PathBuf, Arc<Mutex<()>>> {
    static LOCKS: OnceLock<DashMap<PathBuf, Arc<Mutex<()>>>> = OnceLock::new();
    LOCKS.get_or_init(DashMap::new)
}

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    file_locks()
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// On-disk station configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedStationConfiguration {
    pub configuration_hash: String,
    pub station_info: StationInfo,
    pub configuration_key: Vec<ConfigurationKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_transaction_generator: Option<AtgConfig>,
    #[serde(default)]
    pub automatic_transaction_generator_statuses: BTreeMap<u32, AtgStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connectors_status: Option<BTreeMap<u32, ConnectorState>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evses_status: Option<BTreeMap<u32, EvseState>>,
}

impl PersistedStationConfiguration {
    /// Assemble a persistable snapshot; the hash is computed here
    pub fn from_state(
        station_info: StationInfo,
        configuration_key: Vec<ConfigurationKey>,
        automatic_transaction_generator: Option<AtgConfig>,
        automatic_transaction_generator_statuses: BTreeMap<u32, AtgStatus>,
        topology: &Topology,
    ) -> StationResult<Self> {
        let configuration_hash = configuration_hash(
            &station_info,
            &configuration_key,
            automatic_transaction_generator.as_ref(),
        )?;
        let (connectors_status, evses_status) = match topology {
            Topology::Connectors(connectors) => (Some(connectors.clone()), None),
            Topology::Evses(evses) => (None, Some(evses.clone())),
        };
        Ok(Self {
            configuration_hash,
            station_info,
            configuration_key,
            automatic_transaction_generator,
            automatic_transaction_generator_statuses,
            connectors_status,
            evses_status,
        })
    }

    /// Restore the topology persisted in this file, when consistent
    pub fn topology(&self) -> Option<Topology> {
        match (&self.connectors_status, &self.evses_status) {
            (Some(connectors), None) if !connectors.is_empty() => {
                Some(Topology::Connectors(connectors.clone()))
            }
            (None, Some(evses)) if !evses.is_empty() => Some(Topology::Evses(evses.clone())),
            _ => None,
        }
    }
}

/// SHA-256 over the canonical configuration JSON
pub fn configuration_hash(
    station_info: &StationInfo,
    configuration_key: &[ConfigurationKey],
    automatic_transaction_generator: Option<&AtgConfig>,
) -> StationResult<String> {
    let canonical = serde_json::to_vec(&serde_json::json!({
        "stationInfo": station_info,
        "configurationKey": configuration_key,
        "automaticTransactionGenerator": automatic_transaction_generator,
    }))?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Load a persisted configuration; `Ok(None)` when the file does not exist
pub async fn load(path: &Path) -> StationResult<Option<PersistedStationConfiguration>> {
    let lock = lock_for(path);
    let _guard = lock.lock().await;
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(configuration) => Ok(Some(configuration)),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Discarding unreadable station configuration");
            Ok(None)
        }
    }
}

/// Write a configuration atomically, skipping the write when the on-disk
/// hash already matches
pub async fn save(path: &Path, configuration: &PersistedStationConfiguration) -> StationResult<()> {
    let lock = lock_for(path);
    let _guard = lock.lock().await;

    if let Ok(bytes) = tokio::fs::read(path).await {
        if let Ok(existing) = serde_json::from_slice::<PersistedStationConfiguration>(&bytes) {
            if existing.configuration_hash == configuration.configuration_hash {
                debug!(file = %path.display(), "Configuration hash unchanged, skipping write");
                return Ok(());
            }
        }
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(configuration)?;
    tokio::fs::write(&tmp_path, &bytes).await?;
    tokio::fs::rename(&tmp_path, path).await.map_err(|e| {
        StationError::configuration(format!(
            "Failed to move {} into place: {}",
            tmp_path.display(),
            e
        ))
    })?;
    debug!(file = %path.display(), "Persisted station configuration");
    Ok(())
}
