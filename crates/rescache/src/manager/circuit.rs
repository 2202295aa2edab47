//! Circuit breaker guarding the primary store
//!
//! Five consecutive failures open the circuit for 30 seconds; the next
//! attempt after the hold enters half-open, where one success closes the
//! circuit and any failure reopens it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use rescache_core::{CacheError, CircuitState};

/// Consecutive failures that open the circuit
pub const FAILURE_THRESHOLD: u32 = 5;

/// How long the circuit stays open before probing
pub const OPEN_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Closed,
    Open(Instant),
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<Inner>>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_thresholds(FAILURE_THRESHOLD, OPEN_DURATION)
    }

    pub fn with_thresholds(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                state: State::Closed,
                failures: 0,
                last_failure: None,
            })),
            failure_threshold,
            open_duration,
        }
    }

    /// Check whether a request may proceed. An expired open circuit
    /// transitions to half-open and admits the probe.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open(opened_at) => {
                if opened_at.elapsed() >= self.open_duration {
                    inner.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// A single success closes the circuit from half-open.
    pub fn report_success(&self) {
        let mut inner = self.inner.write();
        inner.state = State::Closed;
        inner.failures = 0;
    }

    pub fn report_failure(&self) {
        let mut inner = self.inner.write();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            State::Closed => {
                inner.failures += 1;
                if inner.failures >= self.failure_threshold {
                    inner.state = State::Open(Instant::now());
                }
            }
            State::HalfOpen => {
                inner.state = State::Open(Instant::now());
            }
            State::Open(_) => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.inner.read().state {
            State::Closed => CircuitState::Closed,
            State::Open(_) => CircuitState::Open,
            State::HalfOpen => CircuitState::HalfOpen,
        }
    }

    /// Consecutive failure count
    pub fn failures(&self) -> u32 {
        self.inner.read().failures
    }

    /// Classify whether an error should trip the breaker
    pub fn is_failure(err: &CacheError) -> bool {
        matches!(
            err,
            CacheError::Connectivity(_) | CacheError::Backend(_) | CacheError::Internal(_)
        )
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
