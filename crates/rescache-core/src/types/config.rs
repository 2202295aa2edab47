//! Configuration records for the cache manager and per-entity behavior

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CacheError, Result, DEFAULT_COMPRESSION_THRESHOLD};

/// Kind of store backing the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Memory,
    RemoteKv,
    File,
}

/// Caching pattern executed per request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Bypass the cache entirely
    None,
    /// Cache-aside: read, fetch on miss, store
    #[default]
    LazyLoading,
    /// Always fetch and store the fresh capture
    WriteThrough,
    /// Serve from cache, refresh in the background near expiry
    RefreshAhead,
    /// Serve from cache, queue writes for deferred persistence
    WriteBehind,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::None => "none",
            CacheStrategy::LazyLoading => "lazy_loading",
            CacheStrategy::WriteThrough => "write_through",
            CacheStrategy::RefreshAhead => "refresh_ahead",
            CacheStrategy::WriteBehind => "write_behind",
        }
    }
}

/// Key derivation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    Simple,
    Hash,
    #[default]
    Hierarchical,
    Semantic,
}

/// TTL selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlStrategy {
    #[default]
    Fixed,
    Adaptive,
    TimeAware,
    VolatilityBased,
    BusinessRules,
}

impl TtlStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtlStrategy::Fixed => "fixed",
            TtlStrategy::Adaptive => "adaptive",
            TtlStrategy::TimeAware => "time_aware",
            TtlStrategy::VolatilityBased => "volatility_based",
            TtlStrategy::BusinessRules => "business_rules",
        }
    }
}

/// Coarse volatility bucket that sets a default TTL range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityClass {
    VeryLow,
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

impl VolatilityClass {
    /// Default TTL for the class
    pub fn default_ttl(&self) -> Duration {
        match self {
            VolatilityClass::VeryLow => Duration::from_secs(24 * 3600),
            VolatilityClass::Low => Duration::from_secs(8 * 3600),
            VolatilityClass::Medium => Duration::from_secs(2 * 3600),
            VolatilityClass::High => Duration::from_secs(30 * 60),
            VolatilityClass::VeryHigh => Duration::from_secs(5 * 60),
        }
    }
}

/// Per-entity cache behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityCacheConfig {
    pub entity_type: String,
    pub default_ttl: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub strategy: CacheStrategy,
    pub ttl_strategy: TtlStrategy,
    /// Permit caching of empty results (empty list / null payload)
    pub cache_empty: bool,
    /// Per-entry byte ceiling; 0 disables the check
    pub max_entry_size: usize,
    pub default_tags: Vec<String>,
    /// Overrides the global key prefix for this entity's keys
    pub key_prefix: Option<String>,
}

/// Default per-entity TTL floor.
pub const DEFAULT_MIN_TTL: Duration = Duration::from_secs(60);
/// Default per-entity TTL ceiling.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(24 * 3600);

impl EntityCacheConfig {
    /// Create a config with defaults for the given entity type
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            default_ttl: Duration::from_secs(300),
            min_ttl: DEFAULT_MIN_TTL,
            max_ttl: DEFAULT_MAX_TTL,
            strategy: CacheStrategy::LazyLoading,
            ttl_strategy: TtlStrategy::Fixed,
            cache_empty: false,
            max_entry_size: 1024 * 1024,
            default_tags: Vec::new(),
            key_prefix: None,
        }
    }

    /// Set the default TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the TTL clamp bounds
    pub fn ttl_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_ttl = min;
        self.max_ttl = max;
        self
    }

    /// Set the caching strategy
    pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the TTL selection strategy
    pub fn ttl_strategy(mut self, strategy: TtlStrategy) -> Self {
        self.ttl_strategy = strategy;
        self
    }

    /// Add default tags applied to every entry of this entity
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Permit caching of empty results
    pub fn cache_empty(mut self) -> Self {
        self.cache_empty = true;
        self
    }

    /// Validate invariants: `min ≤ default ≤ max`
    pub fn validate(&self) -> Result<()> {
        if self.min_ttl > self.default_ttl || self.default_ttl > self.max_ttl {
            return Err(CacheError::Configuration(format!(
                "entity '{}': ttl bounds must satisfy min <= default <= max \
                 (min={:?}, default={:?}, max={:?})",
                self.entity_type, self.min_ttl, self.default_ttl, self.max_ttl
            )));
        }
        Ok(())
    }
}

/// Connection settings for the remote key-value store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteKvConfig {
    pub host: String,
    pub port: u16,
    pub credential: Option<String>,
    pub database: i64,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub pool_size: u32,
    /// Use server-side scripting for atomic entry+tag updates when available
    pub enable_scripting: bool,
}

impl Default for RemoteKvConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            credential: None,
            database: 0,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            pool_size: 10,
            enable_scripting: true,
        }
    }
}

impl RemoteKvConfig {
    /// Build the connection URL
    pub fn url(&self) -> String {
        match &self.credential {
            Some(cred) => format!(
                "redis://:{}@{}:{}/{}",
                cred, self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Top-level cache manager configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Primary store kind
    pub storage_type: StorageKind,
    /// Optional secondary store mirrored on writes
    pub fallback_storage_type: Option<StorageKind>,
    pub remote_kv: RemoteKvConfig,
    /// Root directory for the file store
    pub file_root: PathBuf,
    /// Values over this many bytes are gzipped (remote-KV and file stores)
    pub compression_threshold: usize,
    /// Prepended to every key; also used by tag keys
    pub key_prefix: String,
    pub key_strategy: KeyStrategy,
    /// Keys longer than this are truncated with a digest tail
    pub max_key_length: usize,
    /// Per-entity configuration, keyed by entity-type label
    pub entities: HashMap<String, EntityCacheConfig>,
    /// Used when no per-entity config applies
    pub default_ttl: Duration,
    pub enable_metrics: bool,
    pub enable_warmup: bool,
    /// Enables single-flight collapse of concurrent identical fetches
    pub prevent_stampede: bool,
    /// Caps how long a caller waits on an in-flight peer
    pub stampede_timeout: Duration,
    /// Memory-store byte ceiling for eviction
    pub max_memory_usage: usize,
    /// Memory-store entry ceiling for eviction
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageKind::Memory,
            fallback_storage_type: None,
            remote_kv: RemoteKvConfig::default(),
            file_root: PathBuf::from(".rescache"),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            key_prefix: "rescache".to_string(),
            key_strategy: KeyStrategy::default(),
            max_key_length: 250,
            entities: seeded_entity_configs(),
            default_ttl: Duration::from_secs(300),
            enable_metrics: true,
            enable_warmup: false,
            prevent_stampede: true,
            stampede_timeout: Duration::from_secs(5),
            max_memory_usage: 100 * 1024 * 1024,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    /// Look up the config for an entity type
    pub fn entity(&self, entity_type: &str) -> Option<&EntityCacheConfig> {
        self.entities.get(entity_type)
    }

    /// Insert or replace an entity config
    pub fn with_entity(mut self, config: EntityCacheConfig) -> Self {
        self.entities.insert(config.entity_type.clone(), config);
        self
    }

    /// Validate the whole configuration. Fatal at initialization.
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(CacheError::Configuration(
                "key_prefix must not be empty".to_string(),
            ));
        }
        if self.max_key_length < 32 {
            return Err(CacheError::Configuration(
                "max_key_length must be at least 32".to_string(),
            ));
        }
        if Some(self.storage_type) == self.fallback_storage_type {
            return Err(CacheError::Configuration(
                "fallback store must differ from the primary store".to_string(),
            ));
        }
        for entity in self.entities.values() {
            entity.validate()?;
        }
        Ok(())
    }
}

/// Default configurations for the canonical PSA entity set.
fn seeded_entity_configs() -> HashMap<String, EntityCacheConfig> {
    let seeds = [
        EntityCacheConfig::new("companies")
            .ttl(Duration::from_secs(3600))
            .tags(["company"]),
        EntityCacheConfig::new("contacts")
            .ttl(Duration::from_secs(3600))
            .tags(["contact"]),
        EntityCacheConfig::new("tickets")
            .ttl(Duration::from_secs(300))
            .tags(["ticket"]),
        EntityCacheConfig::new("projects")
            .ttl(Duration::from_secs(900))
            .tags(["project"]),
        EntityCacheConfig::new("contracts")
            .ttl(Duration::from_secs(7200))
            .tags(["contract"]),
        EntityCacheConfig::new("time_entries")
            .ttl(Duration::from_secs(120))
            .tags(["time_entry"]),
        EntityCacheConfig::new("tasks")
            .ttl(Duration::from_secs(300))
            .tags(["task"]),
    ];
    seeds
        .into_iter()
        .map(|c| (c.entity_type.clone(), c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_defaults() {
        let config = EntityCacheConfig::new("companies");
        assert_eq!(config.min_ttl, Duration::from_secs(60));
        assert_eq!(config.max_ttl, Duration::from_secs(86400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_entity_validate_rejects_inverted_bounds() {
        let config = EntityCacheConfig::new("companies")
            .ttl(Duration::from_secs(30))
            .ttl_bounds(Duration::from_secs(60), Duration::from_secs(120));
        assert!(matches!(
            config.validate(),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn test_volatility_defaults() {
        assert_eq!(
            VolatilityClass::VeryLow.default_ttl(),
            Duration::from_secs(86400)
        );
        assert_eq!(
            VolatilityClass::VeryHigh.default_ttl(),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_remote_kv_url() {
        let config = RemoteKvConfig::default();
        assert_eq!(config.url(), "redis://127.0.0.1:6379/0");

        let with_cred = RemoteKvConfig {
            credential: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert_eq!(with_cred.url(), "redis://:hunter2@127.0.0.1:6379/0");
    }

    #[test]
    fn test_config_validate() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());

        let bad = CacheConfig {
            fallback_storage_type: Some(StorageKind::Memory),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_seeded_entities() {
        let config = CacheConfig::default();
        assert!(config.entity("companies").is_some());
        assert!(config.entity("tickets").is_some());
        assert!(config.entity("unknown_entity").is_none());
    }
}
