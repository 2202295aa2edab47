//! File-backed cache store
//!
//! One file per entry under `<root>/<hh>/<sha256-hex>.cache`, where `<hh>`
//! is the first hash byte (256 subdirectories for distribution). Writes go
//! to a temp file and are renamed into place. The key and tag indexes are
//! rebuilt on startup by walking the tree; the original key is persisted
//! inside each file so the index never has to be reverse-engineered from a
//! path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use rescache_core::{
    glob_match, CacheEntry, CacheError, CacheStore, Compressor, GzipCompressor, Result,
    StoreHealth, StoreSize, DEFAULT_COMPRESSION_THRESHOLD,
};

const FILE_EXT: &str = "cache";

/// Configuration for the file store
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Root directory; created with 0o755 if missing
    pub root: PathBuf,
    /// Values over this many bytes are gzipped
    pub compression_threshold: usize,
    /// Interval of the expired-file sweep
    pub cleanup_interval: Duration,
    /// Directory byte ceiling; exceeding it triggers a cleanup (0 = none)
    pub max_bytes: u64,
}

impl FileConfig {
    /// Create config rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            cleanup_interval: Duration::from_secs(60),
            max_bytes: 0,
        }
    }
}

/// On-disk form: the entry plus its original key, so a scan can rebuild
/// the index without guessing keys from paths.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    entry: CacheEntry,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    file_size: u64,
    expires_at: SystemTime,
    tags: Vec<String>,
}

/// File-backed cache store
#[derive(Clone)]
pub struct FileStore {
    config: FileConfig,
    index: Arc<DashMap<String, IndexEntry>>,
    tag_index: Arc<DashMap<String, HashSet<String>>>,
    bytes: Arc<AtomicU64>,
    compressor: GzipCompressor,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FileStore {
    /// Open (or create) a store rooted at `config.root`, rebuilding the
    /// key and tag indexes from disk. Corrupt files are deleted.
    pub async fn open(config: FileConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.root)
            .await
            .map_err(|e| CacheError::Connectivity(format!("create cache root: {e}")))?;
        set_permissions(&config.root, 0o755).await;

        let compressor =
            GzipCompressor::default().with_threshold(config.compression_threshold);
        let store = Self {
            config,
            index: Arc::new(DashMap::new()),
            tag_index: Arc::new(DashMap::new()),
            bytes: Arc::new(AtomicU64::new(0)),
            compressor,
            sweeper: Arc::new(Mutex::new(None)),
        };
        store.rebuild_index().await?;
        if tokio::runtime::Handle::try_current().is_ok() {
            store.start_sweeper();
        }
        Ok(store)
    }

    fn start_sweeper(&self) {
        let store = self.clone();
        let interval = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match store.remove_expired().await {
                    Ok(0) => {}
                    Ok(removed) => {
                        tracing::debug!(removed, "file store sweep removed expired entries");
                    }
                    Err(e) => tracing::warn!(error = %e, "file store sweep failed"),
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let hex = hex::encode(digest);
        self.config
            .root
            .join(&hex[..2])
            .join(format!("{hex}.{FILE_EXT}"))
    }

    async fn rebuild_index(&self) -> Result<()> {
        let mut shards = tokio::fs::read_dir(&self.config.root)
            .await
            .map_err(|e| CacheError::Connectivity(format!("scan cache root: {e}")))?;
        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| CacheError::Connectivity(e.to_string()))?
        {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let Ok(mut files) = tokio::fs::read_dir(&shard_path).await else {
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXT) {
                    continue;
                }
                match self.read_stored(&path).await {
                    Ok(stored) => {
                        let file_size = file
                            .metadata()
                            .await
                            .map(|m| m.len())
                            .unwrap_or(stored.entry.size as u64);
                        self.index_insert(&stored.key, &stored.entry, file_size);
                    }
                    Err(_) => {
                        // Corrupt or unreadable entry: drop it.
                        let _ = tokio::fs::remove_file(&path).await;
                        tracing::warn!(path = %path.display(), "deleted corrupt cache file");
                    }
                }
            }
        }
        Ok(())
    }

    async fn read_stored(&self, path: &Path) -> Result<StoredEntry> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CacheError::Serialization(format!("read cache file: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::Serialization(format!("decode cache file: {e}")))
    }

    fn index_insert(&self, key: &str, entry: &CacheEntry, file_size: u64) {
        self.index_remove(key);
        self.index.insert(
            key.to_string(),
            IndexEntry {
                file_size,
                expires_at: entry.expires_at,
                tags: entry.tags.clone(),
            },
        );
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.bytes.fetch_add(file_size, Ordering::Relaxed);
    }

    fn index_remove(&self, key: &str) -> Option<IndexEntry> {
        let (_, removed) = self.index.remove(key)?;
        self.bytes.fetch_sub(removed.file_size, Ordering::Relaxed);
        for tag in &removed.tags {
            let prune = self
                .tag_index
                .get_mut(tag)
                .map(|mut keys| {
                    keys.remove(key);
                    keys.is_empty()
                })
                .unwrap_or(false);
            if prune {
                self.tag_index.remove(tag);
            }
        }
        Some(removed)
    }

    async fn remove_file(&self, key: &str) -> Result<bool> {
        let existed = self.index_remove(key).is_some();
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(CacheError::Backend(format!("remove cache file: {e}"))),
        }
    }

    async fn remove_expired(&self) -> Result<u64> {
        let now = SystemTime::now();
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|item| item.value().expires_at <= now)
            .map(|item| item.key().clone())
            .collect();
        let mut removed = 0;
        for key in expired {
            if self.remove_file(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Write atomically: temp file in the target shard, then rename.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<u64> {
        let shard = path
            .parent()
            .ok_or_else(|| CacheError::Internal("entry path has no parent".to_string()))?;
        tokio::fs::create_dir_all(shard)
            .await
            .map_err(|e| CacheError::Backend(format!("create shard dir: {e}")))?;
        set_permissions(shard, 0o755).await;

        let tmp = shard.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("entry")
        ));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CacheError::Backend(format!("write cache file: {e}")))?;
        set_permissions(&tmp, 0o644).await;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| CacheError::Backend(format!("rename cache file: {e}")))?;
        Ok(bytes.len() as u64)
    }
}

async fn set_permissions(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

#[async_trait]
impl CacheStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        if !self.index.contains_key(key) {
            return Ok(None);
        }
        let path = self.path_for(key);
        let stored = match self.read_stored(&path).await {
            Ok(stored) => stored,
            Err(_) => {
                // Unreadable entry: treat as a miss and drop it.
                let _ = self.remove_file(key).await;
                return Ok(None);
            }
        };
        if stored.entry.is_expired() {
            self.remove_file(key).await?;
            return Ok(None);
        }

        let mut entry = stored.entry;
        entry.touch();
        // Persist the bumped hit count best-effort; the value bytes on disk
        // are unchanged so a lost update only undercounts hits.
        if let Ok(bytes) = serde_json::to_vec(&StoredEntry {
            key: key.to_string(),
            entry: entry.clone(),
        }) {
            let _ = self.write_atomic(&path, &bytes).await;
        }

        if entry.compressed {
            match self.compressor.decompress(&entry.value) {
                Ok(decompressed) => Ok(Some(entry.with_decompressed(decompressed))),
                Err(_) => {
                    // Undecodable value: treat as a miss and drop the entry.
                    let _ = self.remove_file(key).await;
                    Ok(None)
                }
            }
        } else {
            Ok(Some(entry))
        }
    }

    async fn set(&self, key: &str, mut entry: CacheEntry) -> Result<()> {
        if !entry.compressed && self.compressor.should_compress(&entry.value) {
            let compressed = self.compressor.compress(&entry.value)?;
            entry.mark_compressed(compressed);
        }

        let path = self.path_for(key);
        let bytes = serde_json::to_vec(&StoredEntry {
            key: key.to_string(),
            entry: entry.clone(),
        })
        .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let file_size = self.write_atomic(&path, &bytes).await?;
        self.index_insert(key, &entry, file_size);

        if self.config.max_bytes > 0 && self.bytes.load(Ordering::Relaxed) > self.config.max_bytes
        {
            self.remove_expired().await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if !self.index.contains_key(key) {
            return Ok(false);
        }
        self.remove_file(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let mut count = 0;
        for key in keys {
            if self.delete(key).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        let matching: Vec<String> = self
            .index
            .iter()
            .filter(|item| glob_match(pattern, item.key()))
            .map(|item| item.key().clone())
            .collect();
        let mut count = 0;
        for key in matching {
            if self.remove_file(&key).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_by_tags(&self, tags: &[String]) -> Result<u64> {
        let mut keys: HashSet<String> = HashSet::new();
        for tag in tags {
            if let Some(tagged) = self.tag_index.get(tag) {
                keys.extend(tagged.iter().cloned());
            }
        }
        let mut count = 0;
        for key in keys {
            if self.remove_file(&key).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn keys_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        Ok(self
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .index
            .get(key)
            .is_some_and(|item| item.expires_at > SystemTime::now()))
    }

    async fn clear(&self) -> Result<()> {
        let keys: Vec<String> = self.index.iter().map(|item| item.key().clone()).collect();
        for key in keys {
            self.remove_file(&key).await?;
        }
        Ok(())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .index
            .iter()
            .map(|item| item.key().clone())
            .filter(|k| pattern.is_none_or(|p| glob_match(p, k)))
            .collect())
    }

    async fn size(&self) -> Result<StoreSize> {
        Ok(StoreSize {
            entries: self.index.len(),
            bytes: self.bytes.load(Ordering::Relaxed) as usize,
        })
    }

    async fn cleanup(&self) -> Result<u64> {
        self.remove_expired().await
    }

    async fn expired_count(&self) -> Result<u64> {
        let now = SystemTime::now();
        Ok(self
            .index
            .iter()
            .filter(|item| item.value().expires_at <= now)
            .count() as u64)
    }

    async fn health(&self) -> Result<StoreHealth> {
        let probe_key = "__health_probe__";
        let start = Instant::now();
        let entry = CacheEntry::new(b"ok".to_vec(), Duration::from_secs(5), vec![]);
        self.set(probe_key, entry).await?;
        let read = self.get(probe_key).await?;
        self.delete(probe_key).await?;
        let healthy = read.is_some_and(|e| e.value == b"ok");
        Ok(StoreHealth {
            healthy,
            latency: start.elapsed(),
            error: (!healthy).then(|| "probe round-trip failed".to_string()),
        })
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}
