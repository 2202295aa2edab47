//! High-level cache manager
//!
//! The single composition root: owns the primary store and optional
//! fallback, the key generator, TTL manager, metrics, invalidator, and
//! strategy executor, and gates every read behind a circuit breaker and
//! the single-flight table.

pub(crate) mod circuit;
pub(crate) mod flight;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use rescache_core::{
    CacheConfig, CacheEntry, CacheError, CacheEvent, CacheStore, ChangeType, EntryMetadata,
    EventSink, HealthStatus, JsonSerializer, ReadOutcome, RequestContext, Result, Serializer,
    StorageKind, StoreHealth, StrategyOutcome, TracingSink,
};

use crate::invalidation::{InvalidateOptions, InvalidationTarget, Invalidator};
use crate::key::{KeyGenerator, KeyGeneratorConfig};
use crate::metrics::{MetricsCollector, MetricsSnapshot, MetricsSummary};
use crate::strategy::{ExecuteOptions, StrategyConfig, StrategyExecutor};
use crate::ttl::{TtlConfig, TtlManager};

use circuit::CircuitBreaker;
use flight::Flight;

type WarmupFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<(RequestContext, Value)>>> + Send + Sync>;

/// A named preload procedure run during initialization
#[derive(Clone)]
pub struct WarmupStrategy {
    pub name: String,
    pub entity_types: Vec<String>,
    pub priority: i32,
    /// Per-strategy execution cap
    pub timeout: Duration,
    execute: WarmupFn,
}

impl WarmupStrategy {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        entity_types: Vec<String>,
        priority: i32,
        execute: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<(RequestContext, Value)>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            entity_types,
            priority,
            timeout: Duration::from_secs(30),
            execute: Arc::new(move || Box::pin(execute())),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Cache manager
pub struct CacheManager {
    config: CacheConfig,
    primary: Arc<dyn CacheStore>,
    fallback: Option<Arc<dyn CacheStore>>,
    keys: Arc<KeyGenerator>,
    ttl: Arc<TtlManager>,
    metrics: Arc<MetricsCollector>,
    invalidator: Arc<Invalidator>,
    executor: Arc<StrategyExecutor>,
    breaker: CircuitBreaker,
    flight: Option<Arc<Flight>>,
    sink: Arc<dyn EventSink>,
    serializer: JsonSerializer,
    warmup: RwLock<Vec<WarmupStrategy>>,
}

impl CacheManager {
    /// Initialize every component in dependency order and connect the
    /// stores. Configuration errors are fatal here.
    pub async fn initialize(config: CacheConfig) -> Result<Self> {
        Self::initialize_with_sink(config, Arc::new(TracingSink)).await
    }

    /// Initialize with an explicit event sink
    pub async fn initialize_with_sink(
        config: CacheConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        Self::build(config, sink, None).await
    }

    /// Initialize with an injected primary store (testing seam)
    #[cfg(test)]
    pub(crate) async fn initialize_with_store(
        config: CacheConfig,
        primary: Arc<dyn CacheStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        Self::build(config, sink, Some(primary)).await
    }

    async fn build(
        config: CacheConfig,
        sink: Arc<dyn EventSink>,
        primary_override: Option<Arc<dyn CacheStore>>,
    ) -> Result<Self> {
        config.validate()?;

        let keys = Arc::new(KeyGenerator::new(KeyGeneratorConfig {
            prefix: config.key_prefix.clone(),
            strategy: config.key_strategy,
            max_length: config.max_key_length,
            ..Default::default()
        }));
        let primary = match primary_override {
            Some(store) => store,
            None => build_store(&config, config.storage_type).await?,
        };
        let fallback = match config.fallback_storage_type {
            Some(kind) => Some(build_store(&config, kind).await?),
            None => None,
        };

        let ttl = Arc::new(TtlManager::new(TtlConfig {
            default_ttl: config.default_ttl,
            ..Default::default()
        }));
        let metrics = Arc::new(MetricsCollector::new(config.enable_metrics, sink.clone()));
        let flight = config
            .prevent_stampede
            .then(|| Arc::new(Flight::new(config.stampede_timeout)));
        let executor = Arc::new(StrategyExecutor::new(
            primary.clone(),
            ttl.clone(),
            metrics.clone(),
            sink.clone(),
            flight.clone(),
            StrategyConfig::default(),
        ));
        let invalidator = Arc::new(Invalidator::new(
            primary.clone(),
            keys.clone(),
            sink.clone(),
        ));

        let manager = Self {
            config,
            primary,
            fallback,
            keys,
            ttl,
            metrics,
            invalidator,
            executor,
            breaker: CircuitBreaker::new(),
            flight,
            sink,
            serializer: JsonSerializer,
            warmup: RwLock::new(Vec::new()),
        };

        if manager.config.enable_warmup {
            // Warmup failures never abort initialization.
            let _ = manager.warm_up().await;
        }
        manager.sink.emit(&CacheEvent::Initialized);
        Ok(manager)
    }

    fn key_for(&self, ctx: &RequestContext) -> String {
        match self
            .config
            .entity(&ctx.entity_type)
            .and_then(|e| e.key_prefix.as_deref())
        {
            Some(prefix) => self.keys.generate_with_prefix(ctx, prefix),
            None => self.keys.generate(ctx),
        }
    }

    /// Resolve the cache key this manager derives for a context
    pub fn cache_key(&self, ctx: &RequestContext) -> String {
        self.key_for(ctx)
    }

    /// Read from the primary store. Failures are caught, counted toward
    /// the circuit breaker, and returned inside the outcome record.
    pub async fn get<T: DeserializeOwned>(&self, ctx: &RequestContext) -> ReadOutcome<T> {
        let start = Instant::now();
        if !self.breaker.allow_request() {
            return ReadOutcome::failure(CacheError::CircuitOpen, start.elapsed());
        }

        let key = self.key_for(ctx);
        if let Some(flight) = &self.flight {
            if flight.contains(&key) {
                // A peer is fetching this key; wait for it to land.
                let _ = flight.await_pending(&key).await;
            }
        }

        match self.primary.get(&key).await {
            Ok(Some(entry)) => match self.serializer.deserialize::<T>(&entry.value) {
                Ok(value) => {
                    self.breaker.report_success();
                    self.metrics.record_hit(&ctx.entity_type, start.elapsed());
                    ReadOutcome::hit(value, EntryMetadata::from_entry(&entry), start.elapsed())
                }
                Err(_) => {
                    // Undecodable entry: drop it and report a miss.
                    let _ = self.primary.delete(&key).await;
                    self.breaker.report_success();
                    self.metrics.record_miss(&ctx.entity_type, start.elapsed());
                    ReadOutcome::miss(start.elapsed())
                }
            },
            Ok(None) => {
                self.breaker.report_success();
                self.metrics.record_miss(&ctx.entity_type, start.elapsed());
                ReadOutcome::miss(start.elapsed())
            }
            Err(e) => {
                if CircuitBreaker::is_failure(&e) {
                    self.breaker.report_failure();
                }
                self.metrics.record_error(start.elapsed());
                ReadOutcome::failure(e, start.elapsed())
            }
        }
    }

    /// Execute a caching strategy selected from the options or the
    /// entity's configuration.
    pub async fn execute_strategy<T, F, Fut>(
        &self,
        ctx: RequestContext,
        fetcher: F,
        opts: ExecuteOptions,
    ) -> Result<StrategyOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.breaker.allow_request() {
            return Err(CacheError::CircuitOpen);
        }
        let key = self.key_for(&ctx);
        let entity = self.config.entity(&ctx.entity_type);
        let result = self.executor.execute(key, &ctx, entity, fetcher, opts).await;
        match &result {
            Ok(_) => self.breaker.report_success(),
            Err(e) => {
                if CircuitBreaker::is_failure(e) {
                    self.breaker.report_failure();
                }
                self.metrics.record_error(Duration::ZERO);
            }
        }
        result
    }

    /// Write a value. Returns `false` (without an error) when the entity
    /// forbids empty results, the entry exceeds its size ceiling, or the
    /// store write fails.
    pub async fn set<T: Serialize>(
        &self,
        ctx: &RequestContext,
        value: &T,
        custom_ttl: Option<Duration>,
    ) -> Result<bool> {
        let start = Instant::now();
        let entity = self.config.entity(&ctx.entity_type);

        let json =
            serde_json::to_value(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let cache_empty = entity.map(|e| e.cache_empty).unwrap_or(false);
        if is_empty_value(&json) && !cache_empty {
            return Ok(false);
        }

        let bytes =
            serde_json::to_vec(&json).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let max_entry_size = entity.map(|e| e.max_entry_size).unwrap_or(0);
        if max_entry_size > 0 && bytes.len() > max_entry_size {
            let err = CacheError::Capacity(format!(
                "entry of {} bytes exceeds the {max_entry_size}-byte ceiling for '{}'",
                bytes.len(),
                ctx.entity_type
            ));
            tracing::debug!(error = %err, "value not cached");
            return Ok(false);
        }

        if ctx.verb.is_write() {
            self.ttl.record_update(&ctx.entity_type);
        }

        let ttl = custom_ttl.unwrap_or_else(|| self.ttl.compute(ctx, entity).ttl);
        let tags = entity.map(|e| e.default_tags.clone()).unwrap_or_default();
        let key = self.key_for(ctx);
        let size = bytes.len();
        let entry = CacheEntry::new(bytes, ttl, tags);

        let write_result = match &self.flight {
            Some(flight) => {
                let primary = self.primary.clone();
                let flight_key = key.clone();
                let flight_entry = entry.clone();
                flight
                    .run(&key, move || async move {
                        primary.set(&flight_key, flight_entry).await?;
                        Ok(Vec::new())
                    })
                    .await
                    .map(|_| ())
            }
            None => self.primary.set(&key, entry.clone()).await,
        };

        match write_result {
            Ok(()) => {
                self.breaker.report_success();
                self.metrics.record_set(size, start.elapsed());
                if let Some(fallback) = &self.fallback {
                    // Mirror to the fallback without blocking the caller.
                    let fallback = fallback.clone();
                    let mirror_key = key.clone();
                    tokio::spawn(async move {
                        if let Err(e) = fallback.set(&mirror_key, entry).await {
                            tracing::debug!(key = %mirror_key, error = %e, "fallback mirror failed");
                        }
                    });
                }
                Ok(true)
            }
            Err(e) => {
                if CircuitBreaker::is_failure(&e) {
                    self.breaker.report_failure();
                }
                self.metrics.record_error(start.elapsed());
                Ok(false)
            }
        }
    }

    /// Apply an invalidation with cascade enabled
    pub async fn invalidate(
        &self,
        target: InvalidationTarget,
        entity_type: Option<&str>,
    ) -> Result<u64> {
        let count = self
            .invalidator
            .invalidate(
                target,
                InvalidateOptions {
                    cascade: true,
                    entity_type: entity_type.map(str::to_string),
                    ..Default::default()
                },
            )
            .await?;
        self.metrics.record_delete(count);
        Ok(count)
    }

    /// Evaluate invalidation rules against an entity change
    pub async fn invalidate_by_entity_change(
        &self,
        entity_type: &str,
        data: &Value,
        change: ChangeType,
        entity_id: Option<&str>,
    ) -> Result<u64> {
        self.ttl.record_update(entity_type);
        let count = self
            .invalidator
            .invalidate_by_entity_change(entity_type, data, change, entity_id)
            .await?;
        self.metrics.record_delete(count);
        Ok(count)
    }

    /// Snapshot of the collected metrics
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Ad-hoc summary over recently buffered data points
    pub fn metrics_summary(&self, window: Duration) -> MetricsSummary {
        self.metrics.summary(window)
    }

    /// Hourly metric aggregates, oldest first, covering up to one week
    pub fn metrics_history(&self) -> Vec<crate::metrics::HourBucket> {
        self.metrics.hourly_buckets()
    }

    /// Aggregate health of stores, circuit, and recent traffic
    pub async fn get_health_status(&self) -> HealthStatus {
        let primary = match self.primary.health().await {
            Ok(health) => health,
            Err(e) => StoreHealth {
                healthy: false,
                latency: Duration::ZERO,
                error: Some(e.to_string()),
            },
        };
        if let Ok(size) = self.primary.size().await {
            self.metrics.record_store_bytes(size.bytes);
        }
        let fallback = match &self.fallback {
            Some(store) => Some(match store.health().await {
                Ok(health) => health,
                Err(e) => StoreHealth {
                    healthy: false,
                    latency: Duration::ZERO,
                    error: Some(e.to_string()),
                },
            }),
            None => None,
        };

        let snapshot = self.metrics.snapshot();
        let reads = snapshot.hits + snapshot.misses;
        let error_rate = if reads + snapshot.errors == 0 {
            0.0
        } else {
            snapshot.errors as f64 / (reads + snapshot.errors) as f64
        };
        let circuit_state = self.breaker.state();

        HealthStatus {
            healthy: primary.healthy
                && circuit_state == rescache_core::CircuitState::Closed,
            primary,
            fallback,
            circuit_state,
            hit_rate: snapshot.hit_rate,
            avg_response_time: snapshot.avg_response_time,
            error_rate,
        }
    }

    /// Register a warmup strategy; run by `initialize` when warmup is
    /// enabled, or explicitly via `warm_up`.
    pub fn register_warmup_strategy(&self, strategy: WarmupStrategy) {
        self.warmup.write().push(strategy);
    }

    /// Run all registered warmup strategies in priority order. Individual
    /// failures and timeouts are logged and skipped.
    pub async fn warm_up(&self) -> Result<()> {
        let start = Instant::now();
        let mut strategies: Vec<WarmupStrategy> = self.warmup.read().clone();
        strategies.sort_by(|a, b| b.priority.cmp(&a.priority));

        for strategy in strategies {
            match tokio::time::timeout(strategy.timeout, (strategy.execute)()).await {
                Ok(Ok(entries)) => {
                    tracing::debug!(
                        strategy = %strategy.name,
                        entries = entries.len(),
                        "warmup strategy loaded entries"
                    );
                    for (ctx, value) in entries {
                        let _ = self.set(&ctx, &value, None).await;
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(strategy = %strategy.name, error = %e, "warmup strategy failed");
                }
                Err(_) => {
                    tracing::warn!(strategy = %strategy.name, "warmup strategy timed out");
                }
            }
        }
        self.sink.emit(&CacheEvent::warmup_completed(start.elapsed()));
        Ok(())
    }

    /// Stop timers, flush pending write-behind work best-effort, close
    /// stores, and clear the single-flight table.
    pub async fn shutdown(&self) -> Result<()> {
        self.executor.shutdown().await;
        self.invalidator.shutdown();
        if let Some(flight) = &self.flight {
            flight.clear();
        }
        self.primary.close().await?;
        if let Some(fallback) = &self.fallback {
            fallback.close().await?;
        }
        self.sink.emit(&CacheEvent::Shutdown);
        Ok(())
    }

    /// Direct handle to the primary store (tests and diagnostics)
    pub(crate) fn primary_store(&self) -> Arc<dyn CacheStore> {
        self.primary.clone()
    }

    /// Direct handle to the fallback store, when configured
    pub(crate) fn fallback_store(&self) -> Option<Arc<dyn CacheStore>> {
        self.fallback.clone()
    }

    /// TTL manager handle (volatility tuning at runtime)
    pub fn ttl_manager(&self) -> &TtlManager {
        &self.ttl
    }

    /// Invalidator handle (rule and dependency registration)
    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }
}

async fn build_store(config: &CacheConfig, kind: StorageKind) -> Result<Arc<dyn CacheStore>> {
    match kind {
        StorageKind::Memory => {
            #[cfg(feature = "memory")]
            {
                let memory_config = rescache_storage::MemoryConfig {
                    max_entries: config.max_entries,
                    max_bytes: config.max_memory_usage,
                    ..Default::default()
                };
                Ok(Arc::new(rescache_storage::MemoryStore::new(memory_config)))
            }
            #[cfg(not(feature = "memory"))]
            {
                let _ = config;
                Err(CacheError::Configuration(
                    "memory store support not compiled in".to_string(),
                ))
            }
        }
        StorageKind::File => {
            #[cfg(feature = "file")]
            {
                let mut file_config = rescache_storage::FileConfig::new(&config.file_root);
                file_config.compression_threshold = config.compression_threshold;
                Ok(Arc::new(
                    rescache_storage::FileStore::open(file_config).await?,
                ))
            }
            #[cfg(not(feature = "file"))]
            {
                let _ = config;
                Err(CacheError::Configuration(
                    "file store support not compiled in".to_string(),
                ))
            }
        }
        StorageKind::RemoteKv => {
            #[cfg(feature = "remote-kv")]
            {
                Ok(Arc::new(
                    rescache_storage::RemoteKvStore::connect_with_threshold(
                        config.remote_kv.clone(),
                        format!("{}:", config.key_prefix),
                        config.compression_threshold,
                    )
                    .await?,
                ))
            }
            #[cfg(not(feature = "remote-kv"))]
            {
                let _ = config;
                Err(CacheError::Configuration(
                    "remote-kv store support not compiled in".to_string(),
                ))
            }
        }
    }
}

/// Null, empty arrays/objects, and empty strings count as empty results.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
