//! # Fleet Supervisor
//!
//! Bootstraps the simulator: loads the top-level configuration, opens the
//! control plane, spawns worker hosts, and distributes station instances
//! across them from the configured templates. The supervisor also owns the
//! configuration and template watchers; a change re-evaluates the fleet.

pub mod config;
pub mod error;
pub mod template_store;
pub mod worker;

pub use config::{
    select_supervision_url, ConfigStore, LogConfig, SimulatorConfig, StationTemplateUrl,
    SupervisionUrlDistribution, WorkerConfig, WorkerMode,
};
pub use error::{SupervisorError, SupervisorResult};
pub use template_store::{CachedTemplate, TemplateStore};
pub use worker::WorkerHost;

use async_trait::async_trait;
use fleet_control::{ControlBus, SimulatorControl, UiServer};
use fleet_station::id_tags::IdTagsCache;
use fleet_station::station::StationBuild;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Idle worker hosts beyond the pool minimum are reaped after this long
const POOL_MAX_INACTIVE_TIME: Duration = Duration::from_secs(60);

/// The singleton simulator lifecycle
pub struct Supervisor {
    config_store: Arc<ConfigStore>,
    template_store: Arc<TemplateStore>,
    id_tags: Arc<IdTagsCache>,
    bus: Arc<ControlBus>,
    hosts: RwLock<Vec<Arc<WorkerHost>>>,
    ui_server: Mutex<Option<UiServer>>,
    started: AtomicBool,
    next_worker_id: AtomicUsize,
    self_weak: OnceLock<Weak<Supervisor>>,
}

/// UI-facing handle for the simulator-wide procedures
struct ControlHandle(Weak<Supervisor>);

#[async_trait]
impl SimulatorControl for ControlHandle {
    async fn start_simulator(&self) -> anyhow::Result<()> {
        let Some(supervisor) = self.0.upgrade() else {
            anyhow::bail!("Supervisor is gone");
        };
        supervisor.start().await.map_err(anyhow::Error::from)
    }

    async fn stop_simulator(&self) -> anyhow::Result<()> {
        let Some(supervisor) = self.0.upgrade() else {
            anyhow::bail!("Supervisor is gone");
        };
        supervisor.stop().await.map_err(anyhow::Error::from)
    }
}

impl Supervisor {
    /// Load configuration and build the supervisor; `start()` brings the
    /// fleet up
    pub async fn new(config_file: &Path) -> SupervisorResult<Arc<Self>> {
        let config_store = ConfigStore::load(config_file).await?;
        let supervisor = Arc::new(Self {
            config_store,
            template_store: Arc::new(TemplateStore::new()),
            id_tags: Arc::new(IdTagsCache::new()),
            bus: Arc::new(ControlBus::new()),
            hosts: RwLock::new(Vec::new()),
            ui_server: Mutex::new(None),
            started: AtomicBool::new(false),
            next_worker_id: AtomicUsize::new(0),
            self_weak: OnceLock::new(),
        });
        let _ = supervisor.self_weak.set(Arc::downgrade(&supervisor));

        let weak = Arc::downgrade(&supervisor);
        Arc::clone(&supervisor.config_store)
            .watch(move || {
                if let Some(supervisor) = weak.upgrade() {
                    tokio::spawn(async move {
                        warn!("Configuration changed, re-evaluating the fleet");
                        if let Err(e) = supervisor.restart().await {
                            error!(error = %e, "Restart after configuration change failed");
                        }
                    });
                }
            })
            .await;

        Ok(supervisor)
    }

    pub fn bus(&self) -> Arc<ControlBus> {
        Arc::clone(&self.bus)
    }

    pub async fn log_config(&self) -> LogConfig {
        self.config_store.log().await
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn weak(&self) -> Weak<Supervisor> {
        self.self_weak
            .get()
            .cloned()
            .unwrap_or_else(Weak::new)
    }

    /// Bring the fleet up: UI server, worker hosts, stations
    pub async fn start(&self) -> SupervisorResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::lifecycle("simulator is already started"));
        }
        info!("Starting the fleet simulator");
        if let Err(e) = self.bring_up().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn bring_up(&self) -> Pin<Box<dyn Future<Output = SupervisorResult<()>> + Send + '_>> {
        Box::pin(self.bring_up_inner())
    }

    async fn bring_up_inner(&self) -> SupervisorResult<()> {
        let ui_config = self.config_store.ui_server().await;
        if ui_config.enabled && self.ui_server.lock().await.is_none() {
            let ui = UiServer::new(
                ui_config,
                Arc::clone(&self.bus),
                Arc::new(ControlHandle(self.weak())),
            );
            ui.start().await?;
            *self.ui_server.lock().await = Some(ui);
        }

        let worker_config = self.config_store.worker().await;
        let template_entries = self.config_store.station_template_urls().await;
        if template_entries.is_empty() {
            warn!("No station templates configured");
            return Ok(());
        }
        let supervision_urls = self.config_store.supervision_urls().await?;
        let distribution = self.config_store.supervision_url_distribution().await;
        let config_dir = self.configs_dir().await;
        let auto_reconnect_override = self.config_store.config().await.auto_reconnect_max_retries;

        let mut planned: Vec<StationBuild> = Vec::new();
        let mut template_files: Vec<PathBuf> = Vec::new();
        let mut id_tag_files: Vec<PathBuf> = Vec::new();
        for entry in template_entries {
            let file = self.resolve_template_path(&entry.file);
            let cached = match self.template_store.load(&file).await {
                Ok(cached) => cached,
                Err(e) => {
                    error!(file = %file.display(), error = %e, "Skipping unusable template");
                    continue;
                }
            };
            template_files.push(file.clone());
            let mut template = cached.template.clone();
            if let Some(max_retries) = auto_reconnect_override {
                template.auto_reconnect_max_retries = max_retries;
            }
            // Id-tags files resolve next to their template
            if let Some(tags_file) = &template.id_tags_file {
                if tags_file.is_relative() {
                    if let Some(parent) = file.parent() {
                        template.id_tags_file = Some(parent.join(tags_file));
                    }
                }
            }
            if let Some(tags_file) = &template.id_tags_file {
                if !id_tag_files.contains(tags_file) {
                    id_tag_files.push(tags_file.clone());
                }
            }
            for index in 1..=entry.number_of_stations {
                planned.push(StationBuild {
                    template_file: file.clone(),
                    template: template.clone(),
                    template_hash: cached.hash.clone(),
                    index,
                    supervision_url: select_supervision_url(
                        &supervision_urls,
                        index,
                        distribution,
                    ),
                    config_dir: config_dir.clone(),
                });
            }
        }
        info!(stations = planned.len(), "Spawning stations");

        for build in planned {
            let host = self.host_for_next_element(&worker_config).await;
            if worker_config.element_start_delay > 0 {
                tokio::time::sleep(Duration::from_millis(worker_config.element_start_delay)).await;
            }
            if let Err(e) = host.add_station(build).await {
                error!(worker = host.id(), error = %e, "Station spawn failed");
            }
        }

        if worker_config.process_type == WorkerMode::DynamicPool {
            self.spawn_idle_reaper(worker_config.pool_min_size as usize);
        }

        // Template changes re-evaluate the fleet the same way config changes do
        let weak = self.weak();
        Arc::clone(&self.template_store)
            .watch(template_files, move |file| {
                if let Some(supervisor) = weak.upgrade() {
                    tokio::spawn(async move {
                        warn!(file = %file.display(), "Template changed, re-evaluating the fleet");
                        if let Err(e) = supervisor.restart().await {
                            error!(error = %e, "Restart after template change failed");
                        }
                    });
                }
            })
            .await;

        // Id-tags changes only invalidate the cache; running generators pick
        // the new tags up on their next draw
        if !id_tag_files.is_empty() {
            Arc::clone(&self.id_tags).watch(id_tag_files).await;
        }
        Ok(())
    }

    async fn configs_dir(&self) -> PathBuf {
        match self.config_store.config().await.configs_dir {
            Some(dir) => dir,
            None => self
                .config_store
                .file()
                .parent()
                .map(|parent| parent.join("configs"))
                .unwrap_or_else(|| PathBuf::from("configs")),
        }
    }

    fn resolve_template_path(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.config_store
                .file()
                .parent()
                .map(|parent| parent.join(file))
                .unwrap_or_else(|| file.to_path_buf())
        }
    }

    /// Pick (or create) the host for the next station, per the worker mode
    async fn host_for_next_element(&self, worker_config: &WorkerConfig) -> Arc<WorkerHost> {
        let mut hosts = self.hosts.write().await;
        let capacity = worker_config.elements_per_worker.max(1) as usize;
        let reusable = match worker_config.process_type {
            WorkerMode::WorkerSet | WorkerMode::DynamicPool => hosts
                .iter()
                .find(|host| host.element_count() < capacity)
                .cloned(),
            WorkerMode::StaticPool => {
                if hosts.len() >= worker_config.pool_max_size.max(1) as usize {
                    // Fixed pool: submit to the least-loaded host
                    hosts.iter().min_by_key(|host| host.element_count()).cloned()
                } else {
                    None
                }
            }
        };
        if let Some(host) = reusable {
            return host;
        }
        let at_pool_limit = worker_config.process_type == WorkerMode::DynamicPool
            && hosts.len() >= worker_config.pool_max_size.max(1) as usize;
        if at_pool_limit {
            return hosts
                .iter()
                .min_by_key(|host| host.element_count())
                .cloned()
                .expect("dynamic pool has at least one host at its limit");
        }

        if !hosts.is_empty() && worker_config.worker_start_delay > 0 {
            tokio::time::sleep(Duration::from_millis(worker_config.worker_start_delay)).await;
        }
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let host = WorkerHost::new(
            id,
            Arc::clone(&self.bus),
            Arc::clone(&self.id_tags),
            worker_config.restart_worker_on_error,
        );
        Arc::clone(&host).start().await;
        hosts.push(Arc::clone(&host));
        host
    }

    fn spawn_idle_reaper(&self, pool_min_size: usize) {
        let weak = self.weak();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POOL_MAX_INACTIVE_TIME);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(supervisor) = weak.upgrade() else {
                    return;
                };
                if !supervisor.is_started() {
                    return;
                }
                let mut hosts = supervisor.hosts.write().await;
                let mut index = 0;
                while hosts.len() > pool_min_size && index < hosts.len() {
                    if hosts[index].element_count() == 0 {
                        let host = hosts.remove(index);
                        info!(worker = host.id(), "Reaping idle worker host");
                        host.stop().await;
                    } else {
                        index += 1;
                    }
                }
            }
        });
    }

    /// Stop every station and worker host. The UI server stays up so the
    /// control plane can start the simulator again.
    pub async fn stop(&self) -> SupervisorResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(SupervisorError::lifecycle("simulator is not started"));
        }
        info!("Stopping the fleet simulator");
        self.template_store.stop_watching().await;
        self.id_tags.stop_watching().await;
        let hosts: Vec<Arc<WorkerHost>> = self.hosts.write().await.drain(..).collect();
        for host in hosts {
            host.stop().await;
        }
        Ok(())
    }

    /// `stop` then `start`
    pub async fn restart(&self) -> SupervisorResult<()> {
        if self.is_started() {
            self.stop().await?;
        }
        self.start().await
    }

    /// Full teardown, including the UI server and watchers
    pub async fn shutdown(&self) {
        if self.is_started() {
            if let Err(e) = self.stop().await {
                warn!(error = %e, "Stop during shutdown failed");
            }
        }
        self.config_store.stop_watching().await;
        if let Some(ui) = self.ui_server.lock().await.take() {
            ui.stop().await;
        }
        info!("Fleet simulator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn write_config(
        dir: &tempfile::TempDir,
        extra: serde_json::Value,
    ) -> PathBuf {
        let mut config = json!({
            "supervisionUrls": "ws://127.0.0.1:1/ocpp",
            "stationTemplateUrls": [],
            "uiServer": {"enabled": false},
            "worker": {"elementStartDelay": 0, "workerStartDelay": 0, "elementsPerWorker": 2}
        });
        if let (Some(base), Some(additions)) = (config.as_object_mut(), extra.as_object()) {
            for (key, value) in additions {
                base.insert(key.clone(), value.clone());
            }
        }
        let file = dir.path().join("config.json");
        tokio::fs::write(&file, serde_json::to_vec(&config).unwrap())
            .await
            .unwrap();
        file
    }

    fn write_template(dir: &tempfile::TempDir, name: &str) -> serde_json::Value {
        let template = json!({
            "chargePointModel": "Virtual",
            "chargePointVendor": "FleetSim",
            "power": 22000.0,
            "powerUnit": "W",
            "autoRegister": true,
            "connectors": {"1": {}}
        });
        std::fs::write(
            dir.path().join(name),
            serde_json::to_vec(&template).unwrap(),
        )
        .unwrap();
        template
    }

    #[tokio::test]
    async fn test_start_stop_cycle_with_empty_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = write_config(&dir, json!({})).await;
        let supervisor = Supervisor::new(&config_file).await.unwrap();

        supervisor.start().await.unwrap();
        assert!(supervisor.is_started());
        // Double start is refused
        assert!(supervisor.start().await.is_err());

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_started());
        assert!(supervisor.stop().await.is_err());

        // start(); stop(); start() lands in an equivalent state
        supervisor.start().await.unwrap();
        assert!(supervisor.is_started());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stations_distributed_across_hosts() {
        let dir = tempfile::tempdir().unwrap();
        write_template(&dir, "ac.json");
        let config_file = write_config(
            &dir,
            json!({
                "stationTemplateUrls": [{"file": "ac.json", "numberOfStations": 3}]
            }),
        )
        .await;
        let supervisor = Supervisor::new(&config_file).await.unwrap();
        supervisor.start().await.unwrap();

        // elementsPerWorker = 2: three stations need two hosts
        let hosts = supervisor.hosts.read().await;
        assert_eq!(hosts.len(), 2);
        let total: usize = hosts.iter().map(|host| host.element_count()).sum();
        assert_eq!(total, 3);
        assert_eq!(supervisor.bus().fleet_size(), 3);
        drop(hosts);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_static_pool_round_robins() {
        let dir = tempfile::tempdir().unwrap();
        write_template(&dir, "ac.json");
        let config_file = write_config(
            &dir,
            json!({
                "stationTemplateUrls": [{"file": "ac.json", "numberOfStations": 4}],
                "worker": {
                    "processType": "staticPool",
                    "poolMaxSize": 2,
                    "elementStartDelay": 0,
                    "workerStartDelay": 0
                }
            }),
        )
        .await;
        let supervisor = Supervisor::new(&config_file).await.unwrap();
        supervisor.start().await.unwrap();

        let hosts = supervisor.hosts.read().await;
        assert_eq!(hosts.len(), 2);
        assert!(hosts.iter().all(|host| host.element_count() == 2));
        drop(hosts);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_template_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = write_config(
            &dir,
            json!({
                "stationTemplateUrls": [{"file": "missing.json", "numberOfStations": 2}]
            }),
        )
        .await;
        let supervisor = Supervisor::new(&config_file).await.unwrap();
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.bus().fleet_size(), 0);
        supervisor.shutdown().await;
    }
}
