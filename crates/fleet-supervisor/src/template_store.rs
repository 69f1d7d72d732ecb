//! Template store
//!
//! Parses station templates and caches them keyed by file path; entries are
//! validated against the file's SHA-256 content hash, so an on-disk change
//! invalidates the cache on the next load. A poll task watches registered
//! template files and notifies once per content change. The cache is bounded;
//! the least-recently-loaded entry is evicted when over capacity.

use crate::error::{SupervisorError, SupervisorResult};
use dashmap::DashMap;
use fleet_station::template::{content_hash, StationTemplate};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bound on cached parsed templates
const CACHE_CAPACITY: usize = 64;

/// Poll cadence of the template watcher
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// One parsed template plus its identity hash
#[derive(Debug, Clone)]
pub struct CachedTemplate {
    pub file: PathBuf,
    pub template: StationTemplate,
    pub hash: String,
}

struct CacheEntry {
    cached: Arc<CachedTemplate>,
    last_used: AtomicU64,
}

/// Shared parsed-template cache
pub struct TemplateStore {
    cache: DashMap<PathBuf, CacheEntry>,
    clock: AtomicU64,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateStore {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            clock: AtomicU64::new(0),
            watch_handle: Mutex::new(None),
        }
    }

    /// Load a template, reusing the cached parse while the content hash is
    /// unchanged
    pub async fn load(&self, file: &Path) -> SupervisorResult<Arc<CachedTemplate>> {
        let bytes = tokio::fs::read(file).await.map_err(|e| {
            SupervisorError::configuration(file.display().to_string(), e.to_string())
        })?;
        let hash = content_hash(&bytes);

        if let Some(entry) = self.cache.get(file) {
            if entry.cached.hash == hash {
                entry
                    .last_used
                    .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
                return Ok(Arc::clone(&entry.cached));
            }
            debug!(file = %file.display(), "Template content changed, re-parsing");
        }

        let template = StationTemplate::from_bytes(file, &bytes)?;
        let cached = Arc::new(CachedTemplate {
            file: file.to_path_buf(),
            template,
            hash,
        });
        self.cache.insert(
            file.to_path_buf(),
            CacheEntry {
                cached: Arc::clone(&cached),
                last_used: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed)),
            },
        );
        self.evict_over_capacity();
        info!(file = %file.display(), hash = %cached.hash[..8.min(cached.hash.len())], "Template loaded");
        Ok(cached)
    }

    fn evict_over_capacity(&self) {
        while self.cache.len() > CACHE_CAPACITY {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|entry| entry.last_used.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.cache.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&self, file: &Path) {
        self.cache.remove(file);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Watch template files; `on_change` fires once per content change with
    /// the affected path (the cache entry is invalidated first)
    pub async fn watch<F>(self: Arc<Self>, files: Vec<PathBuf>, on_change: F)
    where
        F: Fn(PathBuf) + Send + Sync + 'static,
    {
        let store = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut hashes: std::collections::HashMap<PathBuf, String> =
                std::collections::HashMap::new();
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for file in &files {
                    let Ok(bytes) = tokio::fs::read(file).await else {
                        continue;
                    };
                    let current = content_hash(&bytes);
                    match hashes.get(file) {
                        None => {
                            hashes.insert(file.clone(), current);
                        }
                        Some(previous) if *previous != current => {
                            warn!(file = %file.display(), "Template file changed on disk");
                            hashes.insert(file.clone(), current);
                            store.invalidate(file);
                            on_change(file.clone());
                        }
                        Some(_) => {}
                    }
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
