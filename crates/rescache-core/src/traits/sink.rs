//! Structured events and the sink capability
//!
//! Components do not inherit emitter behavior; each accepts an
//! [`EventSink`] and pushes structured records through it. Consumers
//! subscribe by handing in a closure, a channel adapter, or
//! [`TracingSink`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Phase of an invalidation event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationPhase {
    Before,
    After,
    Error,
}

/// Structured observable events emitted by cache components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    Initialized,
    Shutdown,
    WarmupCompleted {
        duration_ms: u64,
    },
    Invalidation {
        phase: InvalidationPhase,
        entity_type: Option<String>,
        pattern: String,
        target: String,
        count: Option<u64>,
        error: Option<String>,
        timestamp_ms: u64,
        execution_time_ms: Option<u64>,
    },
    RefreshCompleted {
        key: String,
        success: bool,
        error: Option<String>,
    },
    MetricThresholdExceeded {
        metric: String,
        operator: String,
        value: f64,
        current_value: f64,
        timestamp_ms: u64,
    },
}

impl CacheEvent {
    pub fn warmup_completed(duration: Duration) -> Self {
        CacheEvent::WarmupCompleted {
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn refresh_completed(key: impl Into<String>, success: bool, error: Option<String>) -> Self {
        CacheEvent::RefreshCompleted {
            key: key.into(),
            success,
            error,
        }
    }
}

/// Milliseconds since the Unix epoch, for event timestamps
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Sink for structured cache events
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: &CacheEvent);
}

/// Discards all events (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    #[inline]
    fn emit(&self, _event: &CacheEvent) {}
}

/// Forwards events to the `tracing` subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &CacheEvent) {
        match event {
            CacheEvent::Invalidation {
                phase: InvalidationPhase::Error,
                pattern,
                error,
                ..
            } => {
                tracing::warn!(pattern, ?error, "invalidation failed");
            }
            CacheEvent::RefreshCompleted {
                key,
                success: false,
                error,
            } => {
                tracing::warn!(key, ?error, "background refresh failed");
            }
            CacheEvent::MetricThresholdExceeded {
                metric,
                operator,
                value,
                current_value,
                ..
            } => {
                tracing::warn!(
                    metric,
                    operator,
                    threshold = value,
                    current = current_value,
                    "metric threshold exceeded"
                );
            }
            other => {
                tracing::debug!(event = ?other, "cache event");
            }
        }
    }
}

impl<F> EventSink for F
where
    F: Fn(&CacheEvent) + Send + Sync + 'static,
{
    fn emit(&self, event: &CacheEvent) {
        self(event)
    }
}
