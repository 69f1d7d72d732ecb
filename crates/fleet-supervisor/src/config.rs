//! Top-level configuration store
//!
//! Loads the simulator configuration file, tolerates the deprecated key
//! aliases with a warning, exposes typed views, and watches the file for
//! changes by re-hashing its contents (rapid successive writes coalesce into
//! one change event).

use crate::error::{SupervisorError, SupervisorResult};
use fleet_control::UiServerConfig;
use fleet_station::template::SupervisionUrls;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Poll cadence of the configuration watcher
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Deprecated top-level keys still accepted, with their replacements
const DEPRECATED_KEYS: &[(&str, &str)] = &[
    ("supervisionURLs", "supervisionUrls"),
    ("stationTemplateURLs", "stationTemplateUrls"),
    ("uiWebSocketServer", "uiServer"),
    ("autoReconnectTimeout", "autoReconnectMaxRetries"),
];

/// One template entry: the file plus how many stations to spawn from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationTemplateUrl {
    pub file: PathBuf,
    #[serde(default = "default_number_of_stations")]
    pub number_of_stations: u32,
}

fn default_number_of_stations() -> u32 {
    1
}

/// How stations pick their supervision URL from the configured list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisionUrlDistribution {
    RoundRobin,
    Random,
    ChargingStationAffinity,
    /// Unrecognized configuration value; behaves like affinity
    #[serde(other)]
    Unknown,
}

impl Default for SupervisionUrlDistribution {
    fn default() -> Self {
        SupervisionUrlDistribution::ChargingStationAffinity
    }
}

/// Worker scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerMode {
    WorkerSet,
    StaticPool,
    DynamicPool,
}

impl Default for WorkerMode {
    fn default() -> Self {
        WorkerMode::WorkerSet
    }
}

/// Worker host settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub process_type: WorkerMode,
    /// Stations per host in workerSet mode
    pub elements_per_worker: u32,
    pub pool_min_size: u32,
    pub pool_max_size: u32,
    /// Delay between station starts on one host, in ms
    pub element_start_delay: u64,
    /// Delay between host launches, in ms
    pub worker_start_delay: u64,
    pub restart_worker_on_error: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            process_type: WorkerMode::WorkerSet,
            elements_per_worker: 1,
            pool_min_size: 4,
            pool_max_size: 16,
            element_start_delay: 500,
            worker_start_delay: 500,
            restart_worker_on_error: true,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub enabled: bool,
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Performance-storage sink settings (contract only; the sink itself is an
/// external collaborator)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceStorageConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub storage_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// The top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatorConfig {
    #[serde(alias = "supervisionURLs")]
    pub supervision_urls: Option<SupervisionUrls>,
    pub supervision_url_distribution: SupervisionUrlDistribution,
    #[serde(alias = "stationTemplateURLs")]
    pub station_template_urls: Vec<StationTemplateUrl>,
    pub log: LogConfig,
    pub worker: WorkerConfig,
    #[serde(alias = "uiWebSocketServer")]
    pub ui_server: UiServerConfig,
    pub performance_storage: PerformanceStorageConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reconnect_max_retries: Option<i32>,
    /// Directory for persisted station configurations
    pub configs_dir: Option<PathBuf>,
}

/// Loaded configuration plus the watcher machinery
pub struct ConfigStore {
    file: PathBuf,
    config: RwLock<SimulatorConfig>,
    content_hash: RwLock<String>,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigStore {
    /// Read and parse the configuration file
    pub async fn load(file: &Path) -> SupervisorResult<Arc<Self>> {
        let (config, content_hash) = Self::read(file).await?;
        info!(file = %file.display(), "Configuration loaded");
        Ok(Arc::new(Self {
            file: file.to_path_buf(),
            config: RwLock::new(config),
            content_hash: RwLock::new(content_hash),
            watch_handle: Mutex::new(None),
        }))
    }

    async fn read(file: &Path) -> SupervisorResult<(SimulatorConfig, String)> {
        let bytes = tokio::fs::read(file).await.map_err(|e| {
            SupervisorError::configuration(file.display().to_string(), e.to_string())
        })?;
        let raw: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
            SupervisorError::configuration(file.display().to_string(), e.to_string())
        })?;
        if let Some(object) = raw.as_object() {
            for (deprecated, replacement) in DEPRECATED_KEYS {
                if object.contains_key(*deprecated) {
                    warn!(
                        key = deprecated,
                        replacement, "Deprecated configuration key in use"
                    );
                }
            }
        }
        let config: SimulatorConfig = serde_json::from_value(raw).map_err(|e| {
            SupervisorError::configuration(file.display().to_string(), e.to_string())
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok((config, format!("{:x}", hasher.finalize())))
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub async fn config(&self) -> SimulatorConfig {
        self.config.read().await.clone()
    }

    pub async fn worker(&self) -> WorkerConfig {
        self.config.read().await.worker.clone()
    }

    pub async fn ui_server(&self) -> UiServerConfig {
        self.config.read().await.ui_server.clone()
    }

    pub async fn log(&self) -> LogConfig {
        self.config.read().await.log.clone()
    }

    pub async fn station_template_urls(&self) -> Vec<StationTemplateUrl> {
        self.config.read().await.station_template_urls.clone()
    }

    pub async fn supervision_url_distribution(&self) -> SupervisionUrlDistribution {
        self.config.read().await.supervision_url_distribution
    }

    /// Parsed supervision URLs; configuration without any is unusable
    pub async fn supervision_urls(&self) -> SupervisorResult<Vec<Url>> {
        let config = self.config.read().await;
        let raw = config
            .supervision_urls
            .as_ref()
            .map(|urls| urls.as_vec())
            .unwrap_or_default();
        if raw.is_empty() {
            return Err(SupervisorError::SupervisionUrl(
                "no supervision URLs configured".to_string(),
            ));
        }
        raw.iter()
            .map(|raw_url| {
                Url::parse(raw_url)
                    .map_err(|e| SupervisorError::SupervisionUrl(format!("{}: {}", raw_url, e)))
            })
            .collect()
    }

    /// Re-read the file in place
    pub async fn reload(&self) -> SupervisorResult<()> {
        let (config, content_hash) = Self::read(&self.file).await?;
        *self.config.write().await = config;
        *self.content_hash.write().await = content_hash;
        info!(file = %self.file.display(), "Configuration reloaded");
        Ok(())
    }

    /// Watch the file; `on_change` fires once per observed content change
    pub async fn watch<F>(self: Arc<Self>, on_change: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let store = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Ok(bytes) = tokio::fs::read(&store.file).await else {
                    continue;
                };
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                let current = format!("{:x}", hasher.finalize());
                let changed = {
                    let mut stored = store.content_hash.write().await;
                    if *stored != current {
                        *stored = current;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    debug!(file = %store.file.display(), "Configuration file changed");
                    if let Err(e) = store.reload().await {
                        warn!(error = %e, "Configuration reload failed, keeping previous");
                        continue;
                    }
                    on_change();
                }
            }
        });
        if let Some(previous) = self.watch_handle.lock().await.replace(handle) {
            previous.abort();
        }
    }

    pub async fn stop_watching(&self) {
        if let Some(handle) = self.watch_handle.lock().await.take() {
            handle.abort();
        }
    }
}

/// Pick a supervision URL for a 1-based station index
pub fn select_supervision_url(
    urls: &[Url],
    index: u32,
    distribution: SupervisionUrlDistribution,
) -> Url {
    use rand::Rng;
    match distribution {
        SupervisionUrlDistribution::Random => {
            urls[rand::thread_rng().gen_range(0..urls.len())].clone()
        }
        SupervisionUrlDistribution::RoundRobin
        | SupervisionUrlDistribution::ChargingStationAffinity => {
            urls[(index.saturating_sub(1) as usize) % urls.len()].clone()
        }
        SupervisionUrlDistribution::Unknown => {
            warn!("Unknown supervision URL distribution, falling back to affinity");
            urls[(index.saturating_sub(1) as usize) % urls.len()].clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn config_file(value: serde_json::Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", value).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_minimal_config() {
        let file = config_file(json!({
            "supervisionUrls": "ws://localhost:8180/ocpp",
            "stationTemplateUrls": [{"file": "ac.json", "numberOfStations": 3}]
        }));
        let store = ConfigStore::load(file.path()).await.unwrap();
        let urls = store.supervision_urls().await.unwrap();
        assert_eq!(urls.len(), 1);
        let templates = store.station_template_urls().await;
        assert_eq!(templates[0].number_of_stations, 3);
        assert_eq!(
            store.supervision_url_distribution().await,
            SupervisionUrlDistribution::ChargingStationAffinity
        );
    }

    #[tokio::test]
    async fn test_deprecated_alias_accepted() {
        let file = config_file(json!({
            "supervisionURLs": ["ws://a:1/ocpp", "ws://b:2/ocpp"],
            "stationTemplateUrls": []
        }));
        let store = ConfigStore::load(file.path()).await.unwrap();
        assert_eq!(store.supervision_urls().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_distribution_falls_back() {
        let file = config_file(json!({
            "supervisionUrls": "ws://localhost:8180/ocpp",
            "supervisionUrlDistribution": "no-such-policy",
            "stationTemplateUrls": []
        }));
        let store = ConfigStore::load(file.path()).await.unwrap();
        assert_eq!(
            store.supervision_url_distribution().await,
            SupervisionUrlDistribution::Unknown
        );
        let urls = vec![
            Url::parse("ws://a:1/ocpp").unwrap(),
            Url::parse("ws://b:2/ocpp").unwrap(),
        ];
        // Unknown behaves like affinity
        assert_eq!(
            select_supervision_url(&urls, 1, SupervisionUrlDistribution::Unknown),
            urls[0]
        );
    }

    #[tokio::test]
    async fn test_missing_supervision_urls_is_error() {
        let file = config_file(json!({"stationTemplateUrls": []}));
        let store = ConfigStore::load(file.path()).await.unwrap();
        assert!(store.supervision_urls().await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_config_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(ConfigStore::load(file.path()).await.is_err());
    }

    #[test]
    fn test_round_robin_selection() {
        let urls = vec![
            Url::parse("ws://a:1/ocpp").unwrap(),
            Url::parse("ws://b:2/ocpp").unwrap(),
            Url::parse("ws://c:3/ocpp").unwrap(),
        ];
        assert_eq!(
            select_supervision_url(&urls, 1, SupervisionUrlDistribution::RoundRobin),
            urls[0]
        );
        assert_eq!(
            select_supervision_url(&urls, 2, SupervisionUrlDistribution::RoundRobin),
            urls[1]
        );
        assert_eq!(
            select_supervision_url(&urls, 4, SupervisionUrlDistribution::RoundRobin),
            urls[0]
        );
    }

    #[test]
    fn test_affinity_is_stable() {
        let urls = vec![
            Url::parse("ws://a:1/ocpp").unwrap(),
            Url::parse("ws://b:2/ocpp").unwrap(),
        ];
        let first = select_supervision_url(
            &urls,
            7,
            SupervisionUrlDistribution::ChargingStationAffinity,
        );
        for _ in 0..5 {
            assert_eq!(
                select_supervision_url(
                    &urls,
                    7,
                    SupervisionUrlDistribution::ChargingStationAffinity
                ),
                first
            );
        }
    }

    #[tokio::test]
    async fn test_watch_fires_on_change() {
        let file = config_file(json!({
            "supervisionUrls": "ws://localhost:8180/ocpp",
            "stationTemplateUrls": []
        }));
        let store = ConfigStore::load(file.path()).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::clone(&store)
            .watch(move || {
                let _ = tx.send(());
            })
            .await;

        tokio::fs::write(
            file.path(),
            serde_json::to_vec(&json!({
                "supervisionUrls": "ws://changed:1/ocpp",
                "stationTemplateUrls": []
            }))
            .unwrap(),
        )
        .await
        .unwrap();

        let fired =
            tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv()).await;
        assert!(fired.is_ok());
        let urls = store.supervision_urls().await.unwrap();
        assert_eq!(urls[0].as_str(), "ws://changed:1/ocpp");
        store.stop_watching().await;
    }
}
