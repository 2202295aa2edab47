//! Caching strategy execution
//!
//! Orchestrates one of five patterns per request: bypass, cache-aside,
//! write-through, refresh-ahead (background refresh near expiry), and
//! write-behind (deferred batched persistence).

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;

use rescache_core::{
    CacheEntry, CacheError, CacheEvent, CacheStore, CacheStrategy, EntityCacheConfig, EventSink,
    JsonSerializer, RequestContext, Result, Serializer, StrategyOutcome,
};

use crate::manager::flight::Flight;
use crate::metrics::MetricsCollector;
use crate::ttl::TtlManager;

/// Configuration for the strategy executor
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Fraction of the TTL after which a hit triggers a background refresh
    pub refresh_threshold: f64,
    /// Ceiling on concurrent background refreshes
    pub refresh_concurrency: usize,
    /// Timeout of one background refresh
    pub refresh_timeout: Duration,
    /// Tick interval of the write-behind worker
    pub write_behind_interval: Duration,
    /// Pending writes drained per tick
    pub write_behind_batch: usize,
    /// Queue bound; beyond it new writes become synchronous
    pub write_behind_max_queue: usize,
    /// Collapse queued writes for the same key to the latest
    pub write_behind_coalesce: bool,
    /// Attempts before a failing pending write is dropped
    pub write_behind_max_retries: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: 0.8,
            refresh_concurrency: 5,
            refresh_timeout: Duration::from_secs(30),
            write_behind_interval: Duration::from_secs(5),
            write_behind_batch: 50,
            write_behind_max_queue: 1000,
            write_behind_coalesce: true,
            write_behind_max_retries: 3,
        }
    }
}

/// Per-call options for strategy execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Overrides the entity's configured strategy
    pub strategy: Option<CacheStrategy>,
    /// Bypass the cache read and behave as a miss
    pub force_refresh: bool,
    /// Overrides the TTL manager's decision
    pub ttl: Option<Duration>,
    /// Extra tags applied to the written entry
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    entry: CacheEntry,
    enqueued_at: Instant,
    attempts: u32,
}

/// Strategy executor
pub struct StrategyExecutor {
    store: Arc<dyn CacheStore>,
    serializer: JsonSerializer,
    ttl: Arc<TtlManager>,
    metrics: Arc<MetricsCollector>,
    sink: Arc<dyn EventSink>,
    flight: Option<Arc<Flight>>,
    refreshing: Arc<DashMap<String, ()>>,
    pending_writes: Arc<DashMap<String, PendingWrite>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: StrategyConfig,
}

impl StrategyExecutor {
    pub fn new(
        store: Arc<dyn CacheStore>,
        ttl: Arc<TtlManager>,
        metrics: Arc<MetricsCollector>,
        sink: Arc<dyn EventSink>,
        flight: Option<Arc<Flight>>,
        config: StrategyConfig,
    ) -> Self {
        let executor = Self {
            store,
            serializer: JsonSerializer,
            ttl,
            metrics,
            sink,
            flight,
            refreshing: Arc::new(DashMap::new()),
            pending_writes: Arc::new(DashMap::new()),
            worker: Mutex::new(None),
            config,
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            executor.start_worker();
        }
        executor
    }

    /// Execute the resolved strategy for one request
    pub async fn execute<T, F, Fut>(
        &self,
        key: String,
        ctx: &RequestContext,
        entity: Option<&EntityCacheConfig>,
        fetcher: F,
        opts: ExecuteOptions,
    ) -> Result<StrategyOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let strategy = opts
            .strategy
            .or_else(|| entity.map(|e| e.strategy))
            .unwrap_or_default();
        let start = Instant::now();

        let ttl = opts
            .ttl
            .unwrap_or_else(|| self.ttl.compute(ctx, entity).ttl);
        let mut tags: Vec<String> = entity
            .map(|e| e.default_tags.clone())
            .unwrap_or_default();
        tags.extend(opts.tags.iter().cloned());

        match strategy {
            CacheStrategy::None => {
                let value = fetcher().await?;
                Ok(outcome(value, false, strategy, start, false))
            }
            CacheStrategy::LazyLoading => {
                if !opts.force_refresh {
                    if let Some((value, _)) = self.read_typed::<T>(&key).await? {
                        self.metrics.record_hit(&ctx.entity_type, start.elapsed());
                        return Ok(outcome(value, true, strategy, start, false));
                    }
                }
                self.metrics.record_miss(&ctx.entity_type, start.elapsed());
                let value = self.fetch_and_store(&key, ttl, tags, fetcher).await?;
                Ok(outcome(value, false, strategy, start, false))
            }
            CacheStrategy::WriteThrough => {
                let value = self.fetch_and_store(&key, ttl, tags, fetcher).await?;
                Ok(outcome(value, false, strategy, start, false))
            }
            CacheStrategy::RefreshAhead => {
                if !opts.force_refresh {
                    if let Some((value, entry)) = self.read_typed::<T>(&key).await? {
                        self.metrics.record_hit(&ctx.entity_type, start.elapsed());
                        let threshold = entry.ttl.mul_f64(self.config.refresh_threshold);
                        let refreshed = entry.age() >= threshold
                            && self.try_spawn_refresh(&key, ttl, tags, fetcher);
                        return Ok(outcome(value, true, strategy, start, refreshed));
                    }
                }
                self.metrics.record_miss(&ctx.entity_type, start.elapsed());
                let value = self.fetch_and_store(&key, ttl, tags, fetcher).await?;
                Ok(outcome(value, false, strategy, start, false))
            }
            CacheStrategy::WriteBehind => {
                if !opts.force_refresh {
                    if let Some((value, _)) = self.read_typed::<T>(&key).await? {
                        self.metrics.record_hit(&ctx.entity_type, start.elapsed());
                        return Ok(outcome(value, true, strategy, start, false));
                    }
                }
                self.metrics.record_miss(&ctx.entity_type, start.elapsed());
                let value = self.fetch_and_queue(&key, ttl, tags, fetcher).await?;
                Ok(outcome(value, false, strategy, start, false))
            }
        }
    }

    /// Read and deserialize an entry; an undecodable value is dropped and
    /// reported as a miss.
    async fn read_typed<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, CacheEntry)>> {
        let Some(entry) = self.store.get(key).await? else {
            return Ok(None);
        };
        match self.serializer.deserialize::<T>(&entry.value) {
            Ok(value) => Ok(Some((value, entry))),
            Err(_) => {
                self.store.delete(key).await?;
                Ok(None)
            }
        }
    }

    /// Fetch under single-flight (when enabled), write, and return the
    /// fetched value.
    async fn fetch_and_store<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        tags: Vec<String>,
        fetcher: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let serializer = self.serializer;
        match &self.flight {
            Some(flight) => {
                let store = self.store.clone();
                let metrics = self.metrics.clone();
                let key_owned = key.to_string();
                let bytes = flight
                    .run(key, move || async move {
                        let write_start = Instant::now();
                        let value = fetcher().await?;
                        let bytes = serializer.serialize(&value)?;
                        let entry = CacheEntry::new(bytes.clone(), ttl, tags);
                        store.set(&key_owned, entry).await?;
                        metrics.record_set(bytes.len(), write_start.elapsed());
                        Ok(bytes)
                    })
                    .await?;
                serializer.deserialize(&bytes)
            }
            None => {
                let write_start = Instant::now();
                let value = fetcher().await?;
                let bytes = serializer.serialize(&value)?;
                let size = bytes.len();
                self.store.set(key, CacheEntry::new(bytes, ttl, tags)).await?;
                self.metrics.record_set(size, write_start.elapsed());
                Ok(value)
            }
        }
    }

    /// Fetch under single-flight (when enabled) and queue the write for
    /// deferred persistence, falling back to a synchronous write when the
    /// queue is at its bound.
    async fn fetch_and_queue<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        tags: Vec<String>,
        fetcher: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let serializer = self.serializer;
        let coalesce = self.config.write_behind_coalesce;
        let max_queue = self.config.write_behind_max_queue;
        match &self.flight {
            Some(flight) => {
                let store = self.store.clone();
                let metrics = self.metrics.clone();
                let pending = self.pending_writes.clone();
                let key_owned = key.to_string();
                let bytes = flight
                    .run(key, move || async move {
                        let write_start = Instant::now();
                        let value = fetcher().await?;
                        let bytes = serializer.serialize(&value)?;
                        let entry = CacheEntry::new(bytes.clone(), ttl, tags);
                        if !enqueue_write(&pending, coalesce, max_queue, &key_owned, entry.clone())
                        {
                            // Queue at bound: fail open to a synchronous write.
                            store.set(&key_owned, entry).await?;
                        }
                        metrics.record_set(bytes.len(), write_start.elapsed());
                        Ok(bytes)
                    })
                    .await?;
                serializer.deserialize(&bytes)
            }
            None => {
                let write_start = Instant::now();
                let value = fetcher().await?;
                let bytes = serializer.serialize(&value)?;
                let size = bytes.len();
                let entry = CacheEntry::new(bytes, ttl, tags);
                if !enqueue_write(&self.pending_writes, coalesce, max_queue, key, entry.clone()) {
                    // Queue at bound: fail open to a synchronous write.
                    self.store.set(key, entry).await?;
                }
                self.metrics.record_set(size, write_start.elapsed());
                Ok(value)
            }
        }
    }

    /// Launch a background refresh unless one is already running for this
    /// key or the concurrency ceiling is reached. Returns whether a
    /// refresh was started.
    fn try_spawn_refresh<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        tags: Vec<String>,
        fetcher: F,
    ) -> bool
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.refreshing.len() >= self.config.refresh_concurrency {
            return false;
        }
        match self.refreshing.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(());
            }
        }

        let store = self.store.clone();
        let serializer = self.serializer;
        let sink = self.sink.clone();
        let refreshing = self.refreshing.clone();
        let timeout = self.config.refresh_timeout;
        let key_owned = key.to_string();

        tokio::spawn(async move {
            let refresh = async {
                let value = fetcher().await?;
                let bytes = serializer.serialize(&value)?;
                store.set(&key_owned, CacheEntry::new(bytes, ttl, tags)).await
            };
            let result: Result<()> = match tokio::time::timeout(timeout, refresh).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::RefreshTimeout(key_owned.clone())),
            };
            match result {
                Ok(()) => {
                    sink.emit(&CacheEvent::refresh_completed(&key_owned, true, None));
                }
                Err(e) => {
                    // The stale entry stays until natural expiry.
                    sink.emit(&CacheEvent::refresh_completed(
                        &key_owned,
                        false,
                        Some(e.to_string()),
                    ));
                }
            }
            refreshing.remove(&key_owned);
        });
        true
    }

    /// Pending deferred writes (testing and health reporting)
    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    /// Background refreshes currently running
    pub fn active_refresh_count(&self) -> usize {
        self.refreshing.len()
    }

    fn start_worker(&self) {
        let store = self.store.clone();
        let pending = self.pending_writes.clone();
        let interval = self.config.write_behind_interval;
        let batch = self.config.write_behind_batch;
        let max_retries = self.config.write_behind_max_retries;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let flushed =
                    drain_pending(store.as_ref(), &pending, batch, max_retries).await;
                if flushed > 0 {
                    tracing::debug!(flushed, "write-behind drain persisted entries");
                }
            }
        });
        *self.worker.lock() = Some(handle);
    }

    /// Stop the worker and flush the queue on a best-effort basis.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        while !self.pending_writes.is_empty() {
            let flushed = drain_pending(
                self.store.as_ref(),
                &self.pending_writes,
                self.config.write_behind_batch,
                self.config.write_behind_max_retries,
            )
            .await;
            if flushed == 0 {
                break;
            }
        }
    }
}

fn outcome<T>(
    value: T,
    from_cache: bool,
    strategy: CacheStrategy,
    start: Instant,
    refreshed: bool,
) -> StrategyOutcome<T> {
    StrategyOutcome {
        value,
        from_cache,
        strategy,
        duration: start.elapsed(),
        refreshed,
    }
}

/// Queue a deferred write. Returns `false` when the bound forces a
/// synchronous write instead. With coalescing, a newer write for the same
/// key replaces the queued one; without it, an already-pending key keeps
/// its first write.
fn enqueue_write(
    pending: &DashMap<String, PendingWrite>,
    coalesce: bool,
    max_queue: usize,
    key: &str,
    entry: CacheEntry,
) -> bool {
    let write = PendingWrite {
        entry,
        enqueued_at: Instant::now(),
        attempts: 0,
    };
    if coalesce {
        if pending.len() >= max_queue && !pending.contains_key(key) {
            return false;
        }
        pending.insert(key.to_string(), write);
        true
    } else {
        if pending.contains_key(key) {
            return true;
        }
        if pending.len() >= max_queue {
            return false;
        }
        pending.insert(key.to_string(), write);
        true
    }
}

/// Drain up to `batch` pending writes. Entries that keep failing past the
/// retry bound are dropped.
async fn drain_pending(
    store: &dyn CacheStore,
    pending: &DashMap<String, PendingWrite>,
    batch: usize,
    max_retries: u32,
) -> u64 {
    let keys: Vec<String> = pending
        .iter()
        .take(batch)
        .map(|item| item.key().clone())
        .collect();

    let mut flushed = 0;
    for key in keys {
        let Some((key, mut write)) = pending.remove(&key) else {
            continue;
        };
        match store.set(&key, write.entry.clone()).await {
            Ok(()) => flushed += 1,
            Err(e) => {
                write.attempts += 1;
                if write.attempts < max_retries {
                    // Do not clobber a newer write queued meanwhile.
                    pending.entry(key).or_insert(write);
                    // Brief jittered pause so a down store is not hammered.
                    let pause = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                } else {
                    tracing::warn!(
                        key,
                        queued_for = ?write.enqueued_at.elapsed(),
                        error = %e,
                        "dropping write-behind entry after retries"
                    );
                }
            }
        }
    }
    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rescache_core::NoopSink;
    use rescache_storage::MemoryStore;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    fn executor_with(
        store: Arc<MemoryStore>,
        flight: Option<Arc<Flight>>,
        config: StrategyConfig,
        sink: Arc<dyn EventSink>,
    ) -> StrategyExecutor {
        StrategyExecutor::new(
            store,
            Arc::new(TtlManager::with_defaults()),
            Arc::new(MetricsCollector::disabled()),
            sink,
            flight,
            config,
        )
    }

    fn executor(store: Arc<MemoryStore>) -> StrategyExecutor {
        executor_with(store, None, StrategyConfig::default(), Arc::new(NoopSink))
    }

    fn ctx() -> RequestContext {
        RequestContext::read("companies", "/companies/42").param("id", 42)
    }

    fn entity(strategy: CacheStrategy) -> EntityCacheConfig {
        EntityCacheConfig::new("companies")
            .ttl(Duration::from_secs(60))
            .strategy(strategy)
    }

    #[tokio::test]
    async fn test_lazy_loading_miss_then_hit() {
        let store = Arc::new(MemoryStore::with_defaults());
        let executor = executor(store.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let entity = entity(CacheStrategy::LazyLoading);

        let fetch_calls = calls.clone();
        let first = executor
            .execute::<Value, _, _>(
                "k".to_string(),
                &ctx(),
                Some(&entity),
                move || async move {
                    fetch_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"id": 42, "name": "Acme"}))
                },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.value["name"], "Acme");

        let fetch_calls = calls.clone();
        let second = executor
            .execute::<Value, _, _>(
                "k".to_string(),
                &ctx(),
                Some(&entity),
                move || async move {
                    fetch_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"id": 42, "name": "Acme"}))
                },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_none_strategy_bypasses_store() {
        let store = Arc::new(MemoryStore::with_defaults());
        let executor = executor(store.clone());

        let result = executor
            .execute::<Value, _, _>(
                "k".to_string(),
                &ctx(),
                Some(&entity(CacheStrategy::None)),
                || async { Ok(json!(1)) },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert!(!result.from_cache);
        assert_eq!(store.size().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_write_through_always_fetches() {
        let store = Arc::new(MemoryStore::with_defaults());
        let executor = executor(store.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let entity = entity(CacheStrategy::WriteThrough);

        for _ in 0..2 {
            let fetch_calls = calls.clone();
            let result = executor
                .execute::<Value, _, _>(
                    "k".to_string(),
                    &ctx(),
                    Some(&entity),
                    move || async move {
                        fetch_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("fresh"))
                    },
                    ExecuteOptions::default(),
                )
                .await
                .unwrap();
            assert!(!result.from_cache);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_force_refresh_behaves_as_miss() {
        let store = Arc::new(MemoryStore::with_defaults());
        let executor = executor(store.clone());
        let entity = entity(CacheStrategy::LazyLoading);

        executor
            .execute::<Value, _, _>(
                "k".to_string(),
                &ctx(),
                Some(&entity),
                || async { Ok(json!("old")) },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        let refreshed = executor
            .execute::<Value, _, _>(
                "k".to_string(),
                &ctx(),
                Some(&entity),
                || async { Ok(json!("new")) },
                ExecuteOptions {
                    force_refresh: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!refreshed.from_cache);
        assert_eq!(refreshed.value, json!("new"));
    }

    #[tokio::test]
    async fn test_refresh_ahead_returns_stale_and_refreshes() {
        let store = Arc::new(MemoryStore::with_defaults());
        let events: Arc<StdMutex<Vec<CacheEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink_events = events.clone();
        let executor = executor_with(
            store.clone(),
            None,
            StrategyConfig::default(),
            Arc::new(move |event: &CacheEvent| {
                sink_events.lock().unwrap().push(event.clone());
            }),
        );
        let entity = entity(CacheStrategy::RefreshAhead);

        // Seed an entry already past the refresh threshold.
        let mut entry = CacheEntry::new(
            serde_json::to_vec(&json!("stale")).unwrap(),
            Duration::from_millis(1000),
            vec![],
        );
        entry.created_at = std::time::SystemTime::now() - Duration::from_millis(900);
        entry.expires_at = entry.created_at + Duration::from_millis(1000);
        store.set("k", entry).await.unwrap();

        let result = executor
            .execute::<Value, _, _>(
                "k".to_string(),
                &ctx(),
                Some(&entity),
                || async { Ok(json!("fresh")) },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        // The stale value is returned immediately.
        assert!(result.from_cache);
        assert!(result.refreshed);
        assert_eq!(result.value, json!("stale"));

        // The background refresh overwrites the entry and emits an event.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let read = store.get("k").await.unwrap().unwrap();
        let value: Value = serde_json::from_slice(&read.value).unwrap();
        assert_eq!(value, json!("fresh"));
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            CacheEvent::RefreshCompleted { success: true, .. }
        )));
        assert_eq!(executor.active_refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_ahead_fresh_hit_does_not_refresh() {
        let store = Arc::new(MemoryStore::with_defaults());
        let executor = executor(store.clone());
        let entity = entity(CacheStrategy::RefreshAhead);

        let entry = CacheEntry::new(
            serde_json::to_vec(&json!("fresh")).unwrap(),
            Duration::from_secs(60),
            vec![],
        );
        store.set("k", entry).await.unwrap();

        let result = executor
            .execute::<Value, _, _>(
                "k".to_string(),
                &ctx(),
                Some(&entity),
                || async { Ok(json!("unused")) },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.from_cache);
        assert!(!result.refreshed);
    }

    #[tokio::test]
    async fn test_write_behind_coalesces_to_latest() {
        let store = Arc::new(MemoryStore::with_defaults());
        let config = StrategyConfig {
            write_behind_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let executor = executor_with(store.clone(), None, config, Arc::new(NoopSink));
        let entity = entity(CacheStrategy::WriteBehind);

        for i in 0..20 {
            executor
                .execute::<Value, _, _>(
                    "k".to_string(),
                    &ctx(),
                    Some(&entity),
                    move || async move { Ok(json!(i)) },
                    ExecuteOptions {
                        force_refresh: true,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        // Coalescing keeps at most one pending write for the key (a worker
        // tick may already have drained it).
        assert!(executor.pending_write_count() <= 1);

        // After the next worker tick the store holds the last value.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(executor.pending_write_count(), 0);
        let read = store.get("k").await.unwrap().unwrap();
        let value: Value = serde_json::from_slice(&read.value).unwrap();
        assert_eq!(value, json!(19));
    }

    #[tokio::test]
    async fn test_write_behind_bound_falls_back_to_sync() {
        let store = Arc::new(MemoryStore::with_defaults());
        let config = StrategyConfig {
            write_behind_max_queue: 1,
            // Keep the worker from draining during the test.
            write_behind_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let executor = executor_with(store.clone(), None, config, Arc::new(NoopSink));
        let entity = entity(CacheStrategy::WriteBehind);

        for key in ["a", "b"] {
            executor
                .execute::<Value, _, _>(
                    key.to_string(),
                    &ctx(),
                    Some(&entity),
                    move || async move { Ok(json!(key)) },
                    ExecuteOptions::default(),
                )
                .await
                .unwrap();
        }

        // "a" is queued; "b" hit the bound and was written synchronously.
        assert_eq!(executor.pending_write_count(), 1);
        assert!(store.exists("b").await.unwrap());
        assert!(!store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_writes() {
        let store = Arc::new(MemoryStore::with_defaults());
        let config = StrategyConfig {
            write_behind_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let executor = executor_with(store.clone(), None, config, Arc::new(NoopSink));
        let entity = entity(CacheStrategy::WriteBehind);

        executor
            .execute::<Value, _, _>(
                "k".to_string(),
                &ctx(),
                Some(&entity),
                || async { Ok(json!("queued")) },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(executor.pending_write_count(), 1);

        executor.shutdown().await;
        assert_eq!(executor.pending_write_count(), 0);
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_single_flight_collapses_fetches() {
        let store = Arc::new(MemoryStore::with_defaults());
        let flight = Arc::new(Flight::new(Duration::from_secs(5)));
        let executor = Arc::new(executor_with(
            store.clone(),
            Some(flight),
            StrategyConfig::default(),
            Arc::new(NoopSink),
        ));
        let entity = Arc::new(entity(CacheStrategy::LazyLoading));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let executor = executor.clone();
            let entity = entity.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .execute::<Value, _, _>(
                        "k".to_string(),
                        &ctx(),
                        Some(entity.as_ref()),
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(40)).await;
                            Ok(json!("shared"))
                        },
                        ExecuteOptions::default(),
                    )
                    .await
                    .unwrap()
                    .value
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), json!("shared"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_flight_collapses_write_behind_misses() {
        let store = Arc::new(MemoryStore::with_defaults());
        let flight = Arc::new(Flight::new(Duration::from_secs(5)));
        let config = StrategyConfig {
            // Keep the worker from draining during the test.
            write_behind_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let executor = Arc::new(executor_with(
            store.clone(),
            Some(flight),
            config,
            Arc::new(NoopSink),
        ));
        let entity = Arc::new(entity(CacheStrategy::WriteBehind));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let executor = executor.clone();
            let entity = entity.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .execute::<Value, _, _>(
                        "k".to_string(),
                        &ctx(),
                        Some(entity.as_ref()),
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(40)).await;
                            Ok(json!("deferred"))
                        },
                        ExecuteOptions::default(),
                    )
                    .await
                    .unwrap()
                    .value
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), json!("deferred"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The leader queued exactly one pending write for the key.
        assert_eq!(executor.pending_write_count(), 1);
    }
}
