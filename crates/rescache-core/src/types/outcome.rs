//! Result records returned by manager and store operations

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::{CacheEntry, CacheError, CacheStrategy};

/// Metadata about a stored entry, detached from its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
    pub ttl: Duration,
    pub tags: Vec<String>,
    pub hit_count: u64,
    pub last_accessed: SystemTime,
    pub size: usize,
    pub compressed: bool,
}

impl EntryMetadata {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            ttl: entry.ttl,
            tags: entry.tags.clone(),
            hit_count: entry.hit_count,
            last_accessed: entry.last_accessed,
            size: entry.size,
            compressed: entry.compressed,
        }
    }
}

/// Result of a manager-level read
#[derive(Debug, Clone)]
pub struct ReadOutcome<T> {
    pub value: Option<T>,
    pub hit: bool,
    pub metadata: Option<EntryMetadata>,
    pub duration: Duration,
    pub error: Option<CacheError>,
}

impl<T> ReadOutcome<T> {
    pub fn hit(value: T, metadata: EntryMetadata, duration: Duration) -> Self {
        Self {
            value: Some(value),
            hit: true,
            metadata: Some(metadata),
            duration,
            error: None,
        }
    }

    pub fn miss(duration: Duration) -> Self {
        Self {
            value: None,
            hit: false,
            metadata: None,
            duration,
            error: None,
        }
    }

    pub fn failure(error: CacheError, duration: Duration) -> Self {
        Self {
            value: None,
            hit: false,
            metadata: None,
            duration,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a strategy execution
#[derive(Debug, Clone)]
pub struct StrategyOutcome<T> {
    pub value: T,
    pub from_cache: bool,
    pub strategy: CacheStrategy,
    pub duration: Duration,
    /// Whether a background refresh was launched for this read
    pub refreshed: bool,
}

/// Entry count and byte usage of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSize {
    pub entries: usize,
    pub bytes: usize,
}

/// Result of a store self-test
#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

/// Circuit breaker state, surfaced through health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Aggregate health of the manager and its stores
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub primary: StoreHealth,
    pub fallback: Option<StoreHealth>,
    pub circuit_state: CircuitState,
    pub hit_rate: f64,
    pub avg_response_time: Duration,
    pub error_rate: f64,
}
