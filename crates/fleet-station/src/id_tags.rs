//! Id-tag cache
//!
//! Loads per-station id-tag list files (a JSON array of strings), caches them
//! by path, and issues tags under the generator's distribution policy. A poll
//! task watches registered tag files and drops the cache entry on a content
//! change, so the next issued tag comes from the re-read file.

use crate::error::{StationError, StationResult};
use crate::template::{content_hash, IdTagDistribution};
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Tag issued when no id-tags file is configured
pub const DEFAULT_ID_TAG: &str = "00000000";

/// Poll cadence of the id-tags watcher
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Default)]
struct CachedTags {
    tags: Arc<Vec<String>>,
    round_robin: AtomicUsize,
}

/// Shared id-tag cache, keyed by file path
#[derive(Default)]
pub struct IdTagsCache {
    files: DashMap<PathBuf, CachedTags>,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl IdTagsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or fetch cached) tags for a file
    pub async fn load(&self, file: &Path) -> StationResult<Arc<Vec<String>>> {
        if let Some(cached) = self.files.get(file) {
            return Ok(Arc::clone(&cached.tags));
        }
        let bytes = tokio::fs::read(file).await?;
        let tags: Vec<String> = serde_json::from_slice(&bytes)
            .map_err(|e| StationError::template(file.display().to_string(), e.to_string()))?;
        if tags.is_empty() {
            return Err(StationError::template(
                file.display().to_string(),
                "id-tags file is empty",
            ));
        }
        debug!(file = %file.display(), count = tags.len(), "Loaded id tags");
        let tags = Arc::new(tags);
        self.files.insert(
            file.to_path_buf(),
            CachedTags {
                tags: Arc::clone(&tags),
                round_robin: AtomicUsize::new(0),
            },
        );
        Ok(tags)
    }

    /// Drop a cached file so the next load re-reads it
    pub fn invalidate(&self, file: &Path) {
        self.files.remove(file);
    }

    /// Issue a tag under the given policy. Falls back to [`DEFAULT_ID_TAG`]
    /// when no file is configured or loading fails.
    pub async fn next_tag(
        &self,
        file: Option<&Path>,
        policy: IdTagDistribution,
        connector_id: u32,
    ) -> String {
        let Some(file) = file else {
            return DEFAULT_ID_TAG.to_string();
        };
        let Ok(tags) = self.load(file).await else {
            return DEFAULT_ID_TAG.to_string();
        };
        match policy {
            IdTagDistribution::Random => {
                let index = rand::thread_rng().gen_range(0..tags.len());
                tags[index].clone()
            }
            IdTagDistribution::RoundRobin => {
                let cached = self
                    .files
                    .get(file)
                    .expect("cache entry present after load");
                let index = cached.round_robin.fetch_add(1, Ordering::Relaxed) % tags.len();
                tags[index].clone()
            }
            IdTagDistribution::ConnectorAffinity => {
                tags[(connector_id as usize) % tags.len()].clone()
            }
        }
    }

    /// Watch id-tag files; a content change invalidates the cache entry once
    /// per change so the next issue re-reads the file
    pub async fn watch(self: Arc<Self>, files: Vec<PathBuf>) {
        let cache = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut hashes: HashMap<PathBuf, String> = HashMap::new();
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
                            warn!(file = %file.display(), "Id-tags file changed on disk");
                            hashes.insert(file.clone(), current);
                            cache.invalidate(file);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tags_file(tags: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(tags).unwrap()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_and_cache() {
        let cache = IdTagsCache::new();
        let file = tags_file(&["A", "B", "C"]);
        let tags = cache.load(file.path()).await.unwrap();
        assert_eq!(tags.len(), 3);

        // Second load hits the cache
        let again = cache.load(file.path()).await.unwrap();
        assert!(Arc::ptr_eq(&tags, &again));
    }

    #[tokio::test]
    async fn test_empty_file_rejected() {
        let cache = IdTagsCache::new();
        let file = tags_file(&[]);
        assert!(cache.load(file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_round_robin_policy() {
        let cache = IdTagsCache::new();
        let file = tags_file(&["A", "B"]);
        let first = cache
            .next_tag(Some(file.path()), IdTagDistribution::RoundRobin, 1)
            .await;
        let second = cache
            .next_tag(Some(file.path()), IdTagDistribution::RoundRobin, 1)
            .await;
        let third = cache
            .next_tag(Some(file.path()), IdTagDistribution::RoundRobin, 1)
            .await;
        assert_eq!(first, "A");
        assert_eq!(second, "B");
        assert_eq!(third, "A");
    }

    #[tokio::test]
    async fn test_connector_affinity_policy() {
        let cache = IdTagsCache::new();
        let file = tags_file(&["A", "B", "C"]);
        for _ in 0..3 {
            let tag = cache
                .next_tag(Some(file.path()), IdTagDistribution::ConnectorAffinity, 1)
                .await;
            assert_eq!(tag, "B");
        }
    }

    #[tokio::test]
    async fn test_default_tag_without_file() {
        let cache = IdTagsCache::new();
        let tag = cache.next_tag(None, IdTagDistribution::Random, 1).await;
        assert_eq!(tag, DEFAULT_ID_TAG);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let cache = IdTagsCache::new();
        let file = tags_file(&["A"]);
        let first = cache.load(file.path()).await.unwrap();
        cache.invalidate(file.path());
        let second = cache.load(file.path()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_watch_reloads_changed_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("idtags.json");
        tokio::fs::write(&file, serde_json::to_vec(&["OLD"]).unwrap())
            .await
            .unwrap();

        let cache = Arc::new(IdTagsCache::new());
        let tag = cache
            .next_tag(Some(&file), IdTagDistribution::ConnectorAffinity, 1)
            .await;
        assert_eq!(tag, "OLD");

        Arc::clone(&cache).watch(vec![file.clone()]).await;

        // First poll records the baseline; then change the file
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tokio::fs::write(&file, serde_json::to_vec(&["NEW"]).unwrap())
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let tag = cache
                .next_tag(Some(&file), IdTagDistribution::ConnectorAffinity, 1)
                .await;
            if tag == "NEW" {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("id-tags file change was never picked up");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        cache.stop_watching().await;
    }
}
