//! In-memory cache store with LRU eviction

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use rescache_core::{
    glob_match, CacheEntry, CacheStore, Result, StoreHealth, StoreSize,
};

/// Configuration for the memory store
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum number of entries (0 = unlimited)
    pub max_entries: usize,
    /// Maximum byte usage (0 = unlimited)
    pub max_bytes: usize,
    /// Interval of the expired-entry sweep
    pub cleanup_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 100 * 1024 * 1024,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl MemoryConfig {
    /// Create config with specific bounds
    pub fn with_bounds(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries,
            max_bytes,
            ..Default::default()
        }
    }
}

/// Eviction drains usage to this fraction of each bound.
const EVICT_LOW_WATER: f64 = 0.8;

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// Recency order: lowest sequence = least recently used
    recency: BTreeMap<u64, String>,
    seq_of: HashMap<String, u64>,
    next_seq: u64,
    bytes: usize,
    tag_index: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn touch_recency(&mut self, key: &str) {
        if let Some(old) = self.seq_of.remove(key) {
            self.recency.remove(&old);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.recency.insert(seq, key.to_string());
        self.seq_of.insert(key.to_string(), seq);
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(seq) = self.seq_of.remove(key) {
            self.recency.remove(&seq);
        }
        self.bytes = self.bytes.saturating_sub(entry.size + key.len());
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        Some(entry)
    }

    fn insert_entry(&mut self, key: String, entry: CacheEntry) {
        // Replace any existing entry first so indexes stay consistent.
        self.remove_entry(&key);
        self.bytes += entry.size + key.len();
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.touch_recency(&key);
        self.entries.insert(key, entry);
    }

    /// Drop from the LRU head until usage is at the low-water mark of both
    /// bounds.
    fn evict_to_low_water(&mut self, max_entries: usize, max_bytes: usize) -> u64 {
        let over_entries = max_entries > 0 && self.entries.len() > max_entries;
        let over_bytes = max_bytes > 0 && self.bytes > max_bytes;
        if !over_entries && !over_bytes {
            return 0;
        }

        let entry_target = if max_entries > 0 {
            (max_entries as f64 * EVICT_LOW_WATER) as usize
        } else {
            usize::MAX
        };
        let byte_target = if max_bytes > 0 {
            (max_bytes as f64 * EVICT_LOW_WATER) as usize
        } else {
            usize::MAX
        };

        let mut evicted = 0;
        while self.entries.len() > entry_target || self.bytes > byte_target {
            let Some((&seq, key)) = self.recency.iter().next() else {
                break;
            };
            let key = key.clone();
            self.recency.remove(&seq);
            self.seq_of.remove(&key);
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes = self.bytes.saturating_sub(entry.size + key.len());
                for tag in &entry.tags {
                    if let Some(keys) = self.tag_index.get_mut(tag) {
                        keys.remove(&key);
                        if keys.is_empty() {
                            self.tag_index.remove(tag);
                        }
                    }
                }
                evicted += 1;
            }
        }
        evicted
    }
}

/// In-memory cache store
///
/// Bounded by entry count and byte usage; eviction drops least-recently-used
/// entries until usage falls to 80% of both bounds. A background sweep
/// removes expired entries every `cleanup_interval`. Cloning creates a new
/// handle to the same underlying store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    config: MemoryConfig,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MemoryStore {
    /// Create a new memory store. When called inside a tokio runtime the
    /// periodic cleanup sweep starts immediately.
    pub fn new(config: MemoryConfig) -> Self {
        let store = Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            config,
            sweeper: Arc::new(Mutex::new(None)),
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            store.start_sweeper();
        }
        store
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(MemoryConfig::default())
    }

    fn start_sweeper(&self) {
        let inner = self.inner.clone();
        let interval = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = sweep_expired(&inner);
                if removed > 0 {
                    tracing::debug!(removed, "memory store sweep removed expired entries");
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }
}

fn sweep_expired(inner: &RwLock<Inner>) -> u64 {
    let expired: Vec<String> = {
        let guard = inner.read();
        guard
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect()
    };
    if expired.is_empty() {
        return 0;
    }
    let mut guard = inner.write();
    let mut removed = 0;
    for key in expired {
        // Re-check under the write lock; a concurrent set may have replaced it.
        if guard.entries.get(&key).is_some_and(|e| e.is_expired()) {
            guard.remove_entry(&key);
            removed += 1;
        }
    }
    removed
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut inner = self.inner.write();
        match inner.entries.get(key).map(CacheEntry::is_expired) {
            Some(true) => {
                inner.remove_entry(key);
                Ok(None)
            }
            Some(false) => {
                inner.touch_recency(key);
                let entry = inner.entries.get_mut(key).expect("present under lock");
                entry.touch();
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let mut inner = self.inner.write();
        inner.insert_entry(key.to_string(), entry);
        inner.evict_to_low_water(self.config.max_entries, self.config.max_bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.write().remove_entry(key).is_some())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut count = 0;
        for key in keys {
            if inner.remove_entry(key).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        let mut inner = self.inner.write();
        let matching: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        let mut count = 0;
        for key in matching {
            if inner.remove_entry(&key).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_by_tags(&self, tags: &[String]) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut keys: HashSet<String> = HashSet::new();
        for tag in tags {
            if let Some(tagged) = inner.tag_index.get(tag) {
                keys.extend(tagged.iter().cloned());
            }
        }
        let mut count = 0;
        for key in keys {
            if inner.remove_entry(&key).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn keys_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let inner = self.inner.read();
        Ok(inner
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let inner = self.inner.read();
        Ok(inner.entries.get(key).is_some_and(|e| !e.is_expired()))
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.write() = Inner::default();
        Ok(())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let inner = self.inner.read();
        Ok(inner
            .entries
            .keys()
            .filter(|k| pattern.is_none_or(|p| glob_match(p, k)))
            .cloned()
            .collect())
    }

    async fn size(&self) -> Result<StoreSize> {
        let inner = self.inner.read();
        Ok(StoreSize {
            entries: inner.entries.len(),
            bytes: inner.bytes,
        })
    }

    async fn cleanup(&self) -> Result<u64> {
        Ok(sweep_expired(&self.inner))
    }

    async fn expired_count(&self) -> Result<u64> {
        let inner = self.inner.read();
        Ok(inner.entries.values().filter(|e| e.is_expired()).count() as u64)
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
