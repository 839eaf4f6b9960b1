// ABOUTME: Size-bounded on-disk cache of downloaded source files keyed by URL
// ABOUTME: LRU eviction, self-healing lookups, and JSON metadata for recovery across restarts

use super::{FileError, Result};
use crate::config::CacheConfig;
use crate::types::Language;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const METADATA_FILE: &str = "cache_metadata.json";

const SOURCE_EXTENSIONS: [&str; 5] = ["go", "py", "js", "ts", "mjs"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedFile {
    pub path: PathBuf,
    pub hash: String,
    pub last_accessed: DateTime<Utc>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub item_count: usize,
    pub size: u64,
    pub max_size: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedFile>,
    size: u64,
    hit_count: u64,
    miss_count: u64,
    eviction_count: u64,
}

impl CacheState {
    fn insert(&mut self, key: String, file: CachedFile) {
        self.size += file.size;
        if let Some(previous) = self.entries.insert(key, file) {
            self.size -= previous.size;
        }
    }

    fn remove(&mut self, key: &str) -> Option<CachedFile> {
        let removed = self.entries.remove(key)?;
        self.size -= removed.size;
        Some(removed)
    }
}

pub struct FileCache {
    cache_dir: PathBuf,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl FileCache {
    /// Open (creating if needed) the cache directory and index what is already there
    pub async fn new(config: CacheConfig) -> Result<Self> {
        let cache_dir = config.cache_dir.clone();
        tokio::fs::create_dir_all(&cache_dir).await.map_err(|source| {
            FileError::io(
                format!("failed to create cache directory {}", cache_dir.display()),
                source,
            )
        })?;

        let cache = Self {
            cache_dir,
            config,
            state: Mutex::new(CacheState::default()),
        };

        if let Err(e) = cache.load_existing_files().await {
            warn!("Failed to load existing cached files: {}", e);
        }
        cache.trim().await;

        Ok(cache)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Return the cached path for `key`, downloading and storing it on a miss.
    ///
    /// An entry whose file vanished from disk is purged and treated as a miss.
    pub async fn get_or_download<F, Fut>(
        &self,
        key: &str,
        language: Language,
        download: F,
    ) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        {
            let mut state = self.state.lock().await;
            if let Some(path) = state.entries.get(key).map(|entry| entry.path.clone()) {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    state.hit_count += 1;
                    if let Some(entry) = state.entries.get_mut(key) {
                        entry.last_accessed = Utc::now();
                    }
                    self.persist(&state).await;
                    debug!("Cache hit for {}", key);
                    return Ok(path);
                }

                warn!("Cached file missing on disk, purging: {}", path.display());
                state.remove(key);
                self.persist(&state).await;
            }

            state.miss_count += 1;
        }

        debug!("Cache miss for {}", key);
        let content = download().await?;
        self.store_file(key, language, &content).await
    }

    /// Write `content` under a filename derived from `key` and index it
    pub async fn store_file(&self, key: &str, language: Language, content: &[u8]) -> Result<PathBuf> {
        let size = content.len() as u64;
        if size > self.config.max_cache_size {
            return Err(FileError::TooLarge {
                size,
                max: self.config.max_cache_size,
            });
        }

        let path = self.cache_dir.join(cache_file_name(key, language));
        let mut state = self.state.lock().await;

        // A refresh of the same key frees its old bytes first
        if let Some(previous) = state.remove(key) {
            if previous.path != path {
                remove_file_quietly(&previous.path).await;
            }
        }
        self.ensure_space_locked(&mut state, size).await;

        tokio::fs::write(&path, content).await.map_err(|source| {
            FileError::io(format!("failed to write cached file {}", path.display()), source)
        })?;

        let now = Utc::now();
        state.insert(
            key.to_string(),
            CachedFile {
                path: path.clone(),
                hash: key.to_string(),
                last_accessed: now,
                size,
                created_at: now,
            },
        );
        self.persist(&state).await;

        info!("Stored file in cache (size: {} bytes)", size);
        Ok(path)
    }

    /// Evict least recently accessed entries until `required` more bytes fit
    pub async fn ensure_space(&self, required: u64) {
        let mut state = self.state.lock().await;
        self.ensure_space_locked(&mut state, required).await;
    }

    async fn ensure_space_locked(&self, state: &mut CacheState, required: u64) {
        if state.size + required <= self.config.max_cache_size {
            return;
        }

        let target = self.config.max_cache_size.saturating_sub(required);
        let evicted = self.evict_until(state, target).await;
        info!(
            "Evicted {} files from cache to make room for {} bytes",
            evicted, required
        );
        self.persist(state).await;
    }

    /// Shrink an over-full cache to `max_cache_size - eviction_size`
    async fn trim(&self) {
        let mut state = self.state.lock().await;
        if state.size <= self.config.max_cache_size {
            return;
        }

        let target = self
            .config
            .max_cache_size
            .saturating_sub(self.config.eviction_size);
        let evicted = self.evict_until(&mut state, target).await;
        info!("Trimmed {} files from over-full cache", evicted);
        self.persist(&state).await;
    }

    async fn evict_until(&self, state: &mut CacheState, target: u64) -> usize {
        let mut by_age: Vec<(String, DateTime<Utc>)> = state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_accessed))
            .collect();
        by_age.sort_by_key(|(_, accessed)| *accessed);

        let mut evicted = 0;
        for (key, _) in by_age {
            if state.size <= target {
                break;
            }
            if let Some(entry) = state.remove(&key) {
                remove_file_quietly(&entry.path).await;
                state.eviction_count += 1;
                evicted += 1;
                debug!("Evicted cached file: {} (size: {} bytes)", key, entry.size);
            }
        }
        evicted
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.state.lock().await.entries.contains_key(key)
    }

    pub async fn get(&self, key: &str) -> Option<CachedFile> {
        self.state.lock().await.entries.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.remove(key) {
            Some(entry) => {
                remove_file_quietly(&entry.path).await;
                self.persist(&state).await;
                true
            }
            None => false,
        }
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in keys {
            if let Some(entry) = state.remove(&key) {
                remove_file_quietly(&entry.path).await;
            }
        }
        self.persist(&state).await;
        info!("Cleared file cache");
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let lookups = state.hit_count + state.miss_count;
        CacheStats {
            item_count: state.entries.len(),
            size: state.size,
            max_size: self.config.max_cache_size,
            hit_count: state.hit_count,
            miss_count: state.miss_count,
            eviction_count: state.eviction_count,
            hit_rate: if lookups > 0 {
                state.hit_count as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    /// Index the metadata file, then any stray source files it does not mention
    async fn load_existing_files(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        let metadata_path = self.cache_dir.join(METADATA_FILE);
        if tokio::fs::try_exists(&metadata_path).await.unwrap_or(false) {
            if let Err(e) = self.load_metadata(&mut state, &metadata_path).await {
                warn!("Failed to load cache metadata: {}", e);
            }
        }

        let mut entries = tokio::fs::read_dir(&self.cache_dir).await.map_err(|source| {
            FileError::io(
                format!("failed to read cache directory {}", self.cache_dir.display()),
                source,
            )
        })?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| FileError::io("failed to read cache entry", source))?
        {
            let path = entry.path();
            let is_source = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
            if !is_source || state.entries.values().any(|cached| cached.path == path) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Failed to stat cached file {}: {}", path.display(), e);
                    continue;
                }
            };

            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let key = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();

            state.insert(
                key.clone(),
                CachedFile {
                    path,
                    hash: key,
                    last_accessed: modified,
                    size: metadata.len(),
                    created_at: modified,
                },
            );
        }

        info!("Loaded {} existing cached files", state.entries.len());
        Ok(())
    }

    async fn load_metadata(&self, state: &mut CacheState, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| FileError::io("failed to read cache metadata", source))?;
        let metadata: HashMap<String, CachedFile> = serde_json::from_slice(&data)?;

        for (key, cached) in metadata {
            if tokio::fs::try_exists(&cached.path).await.unwrap_or(false) {
                state.insert(key, cached);
            }
        }
        Ok(())
    }

    async fn persist(&self, state: &CacheState) {
        if let Err(e) = self.save_metadata(state).await {
            warn!("Failed to save cache metadata: {}", e);
        }
    }

    async fn save_metadata(&self, state: &CacheState) -> Result<()> {
        let data = serde_json::to_vec_pretty(&state.entries)?;
        tokio::fs::write(self.cache_dir.join(METADATA_FILE), data)
            .await
            .map_err(|source| FileError::io("failed to write cache metadata", source))
    }
}

/// On-disk name for a cache key: non-alphanumerics become `_`, plus the language extension
pub fn cache_file_name(key: &str, language: Language) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}{}", sanitized, language.extension())
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove cached file {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(dir: &TempDir, max: u64) -> CacheConfig {
        CacheConfig {
            cache_dir: dir.path().to_path_buf(),
            max_cache_size: max,
            eviction_size: max / 4,
            max_file_size: max,
        }
    }

    #[test]
    fn test_cache_file_name_is_sanitized() {
        assert_eq!(
            cache_file_name("https://example.com/path/file", Language::Go),
            "https___example_com_path_file.go"
        );
        assert_eq!(cache_file_name("a.b", Language::Node), "a_b.js");
    }

    #[tokio::test]
    async fn test_store_then_hit_skips_download() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(config(&dir, 1024)).await.unwrap();
        let key = "https://example.com/path/file";

        let stored = cache
            .store_file(key, Language::Go, b"package main")
            .await
            .unwrap();

        let calls = AtomicUsize::new(0);
        let found = cache
            .get_or_download(key, Language::Go, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(b"other".to_vec())
            })
            .await
            .unwrap();

        assert_eq!(found, stored);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().await.hit_count, 1);
    }

    #[tokio::test]
    async fn test_eviction_removes_least_recently_accessed() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(config(&dir, 50)).await.unwrap();

        let first = cache.store_file("first", Language::Py, &[b'a'; 30]).await.unwrap();
        let second = cache.store_file("second", Language::Py, &[b'b'; 30]).await.unwrap();

        assert!(!first.exists());
        assert!(second.exists());
        assert!(!cache.contains("first").await);

        let stats = cache.stats().await;
        assert_eq!(stats.size, 30);
        assert_eq!(stats.eviction_count, 1);

        let calls = AtomicUsize::new(0);
        let refetched = cache
            .get_or_download("first", Language::Py, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![b'a'; 30])
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(refetched.exists());
        assert!(cache.contains("first").await);
        assert_eq!(cache.stats().await.miss_count, 1);
    }

    #[tokio::test]
    async fn test_ensure_space_keeps_recent_entries() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(config(&dir, 100)).await.unwrap();

        cache.store_file("a", Language::Py, &[0; 30]).await.unwrap();
        cache.store_file("b", Language::Py, &[0; 30]).await.unwrap();
        cache.store_file("c", Language::Py, &[0; 30]).await.unwrap();

        // touch "a" so "b" becomes the oldest
        cache
            .get_or_download("a", Language::Py, || async { Ok(Vec::new()) })
            .await
            .unwrap();

        cache.ensure_space(40).await;

        assert!(cache.contains("a").await);
        assert!(!cache.contains("b").await);
        assert!(cache.contains("c").await);
        assert!(cache.stats().await.size + 40 <= 100);
    }

    #[tokio::test]
    async fn test_missing_file_is_redownloaded() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(config(&dir, 1024)).await.unwrap();

        let path = cache.store_file("key", Language::Js, b"1").await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let refreshed = cache
            .get_or_download("key", Language::Js, || async { Ok(b"console.log(2)".to_vec()) })
            .await
            .unwrap();

        assert_eq!(std::fs::read(&refreshed).unwrap(), b"console.log(2)".to_vec());
        assert_eq!(cache.stats().await.miss_count, 1);
    }

    #[tokio::test]
    async fn test_download_failure_creates_no_entry() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(config(&dir, 1024)).await.unwrap();

        let err = cache
            .get_or_download("key", Language::Py, || async {
                Err(FileError::DownloadFailed("connection refused".to_string()))
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("connection refused"));
        assert!(!cache.contains("key").await);
    }

    #[tokio::test]
    async fn test_oversized_content_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(config(&dir, 10)).await.unwrap();

        let err = cache
            .store_file("big", Language::Py, &[0; 11])
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::TooLarge { size: 11, max: 10 }));
    }

    #[tokio::test]
    async fn test_metadata_survives_restart() {
        let dir = TempDir::new().unwrap();
        let key = "https://example.com/job.py";
        let path = {
            let cache = FileCache::new(config(&dir, 1024)).await.unwrap();
            cache.store_file(key, Language::Py, b"print(1)").await.unwrap()
        };

        let reopened = FileCache::new(config(&dir, 1024)).await.unwrap();
        let entry = reopened.get(key).await.unwrap();
        assert_eq!(entry.path, path);
        assert_eq!(entry.size, 8);
        assert_eq!(reopened.stats().await.item_count, 1);
    }

    #[tokio::test]
    async fn test_stray_files_are_indexed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("orphan.go"), "package main").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let cache = FileCache::new(config(&dir, 1024)).await.unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats.item_count, 1);
        assert_eq!(stats.size, 12);
        assert!(cache.contains("orphan").await);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(config(&dir, 1024)).await.unwrap();

        let a = cache.store_file("a", Language::Go, b"a").await.unwrap();
        cache.store_file("b", Language::Go, b"b").await.unwrap();

        assert!(cache.remove("a").await);
        assert!(!a.exists());
        assert!(!cache.remove("a").await);

        cache.clear().await;
        assert_eq!(cache.stats().await.item_count, 0);
        assert_eq!(cache.stats().await.size, 0);
    }
}
