//! Error types for cache operations

use thiserror::Error;

/// Main error type for all cache operations
///
/// `Clone` is required: single-flight fans results out to waiting callers
/// over a broadcast channel.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Malformed or contradictory configuration. Fatal at initialization.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A store is unreachable. Counts toward the circuit breaker.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// A persisted entry cannot be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Entry exceeds a per-entity or store bound.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// A rule evaluation or invalidation action failed.
    #[error("invalidation rule '{rule}' failed: {reason}")]
    InvalidationRule { rule: String, reason: String },

    /// A caller waited past the stampede timeout on an in-flight peer.
    #[error("timed out waiting on in-flight fetch for key: {0}")]
    StampedeTimeout(String),

    /// A background refresh exceeded its timeout.
    #[error("background refresh timed out for key: {0}")]
    RefreshTimeout(String),

    /// A read arrived while the circuit breaker was open.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Backend operation failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
