//! rescache: adaptive response cache for remote API clients
//!
//! # Features
//!
//! - **Pluggable stores** (memory, remote-KV, file) with tag indexes
//! - **Five caching strategies** (cache-aside, write-through,
//!   refresh-ahead, write-behind, bypass)
//! - **Adaptive TTL** from entity type, update history, business hours,
//!   and content volatility
//! - **Rule-driven invalidation** with cascades across dependent entities
//! - **Stampede protection** and a circuit breaker in front of the store
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use rescache::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let cache = CacheManager::initialize(CacheConfig::default()).await?;
//!
//!     let ctx = RequestContext::read("companies", "/v1/companies/42").param("id", 42);
//!     let outcome = cache
//!         .execute_strategy(ctx, || async {
//!             // fetch from the remote API on a miss
//!             Ok(serde_json::json!({"id": 42, "name": "Acme"}))
//!         }, ExecuteOptions::default())
//!         .await?;
//!
//!     println!("fromCache={} value={}", outcome.from_cache, outcome.value);
//!     cache.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod invalidation;
mod key;
mod manager;
mod metrics;
mod strategy;
mod ttl;

// Re-export core
pub use rescache_core::*;

// Re-export storage
#[cfg(feature = "file")]
pub use rescache_storage::{FileConfig, FileStore};
#[cfg(feature = "memory")]
pub use rescache_storage::{MemoryConfig, MemoryStore};
#[cfg(feature = "remote-kv")]
pub use rescache_storage::RemoteKvStore;

pub use invalidation::{
    BatchOperation, BatchReport, ConditionOp, EntityDependency, InvalidateOptions,
    InvalidationCondition, InvalidationRule, InvalidationTarget, Invalidator,
};
pub use key::{KeyGenerator, KeyGeneratorConfig};
pub use manager::{CacheManager, WarmupStrategy};
pub use metrics::{
    EntityMetrics, HourBucket, MetricsCollector, MetricsSnapshot, MetricsSummary,
    ThresholdDescriptor, ThresholdOp,
};
pub use strategy::{ExecuteOptions, StrategyConfig, StrategyExecutor};
pub use ttl::{TtlConfig, TtlDecision, TtlManager};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ApiVerb, CacheConfig, CacheError, CacheEvent, CacheManager, CacheStrategy, ChangeType,
        EntityCacheConfig, ExecuteOptions, InvalidationTarget, KeyStrategy, RequestContext,
        Result, StorageKind, TtlStrategy,
    };

    #[cfg(feature = "memory")]
    pub use crate::{MemoryConfig, MemoryStore};

    #[cfg(feature = "file")]
    pub use crate::{FileConfig, FileStore};

    #[cfg(feature = "remote-kv")]
    pub use crate::RemoteKvStore;
}
