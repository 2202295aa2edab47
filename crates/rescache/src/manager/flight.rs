//! Single-flight table for stampede prevention
//!
//! The first caller for a key becomes the leader and executes the fetch;
//! concurrent callers subscribe to the leader's result. Waiters race a
//! timeout so a stuck backend cannot deadlock them, and the leader's slot
//! is released on completion or cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;

use rescache_core::{CacheError, Result};

type FlightResult = Result<Vec<u8>>;

#[derive(Clone)]
pub struct Flight {
    inflight: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
    timeout: Duration,
}

/// Releases the leader's slot even when the leader is cancelled mid-fetch.
struct SlotGuard<'a> {
    inflight: &'a DashMap<String, broadcast::Sender<FlightResult>>,
    key: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(self.key);
    }
}

impl Flight {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Number of fetches currently in flight
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Drop all in-flight slots (shutdown)
    pub fn clear(&self) {
        self.inflight.clear();
    }

    /// Whether a fetch is in flight for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Execute `f` under single-flight for `key`. Concurrent callers for
    /// the same key receive the leader's result; a waiter that outlives
    /// the timeout gets `StampedeTimeout` while the leader is unaffected.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult> + Send,
    {
        // The entry lock must drop before any await.
        let action = match self.inflight.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                Ok(occupied.get().subscribe())
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(1);
                vacant.insert(tx.clone());
                Err(tx)
            }
        };

        match action {
            Ok(mut rx) => match tokio::time::timeout(self.timeout, rx.recv()).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(CacheError::Internal(
                    "in-flight fetch ended without a result".to_string(),
                )),
                Err(_) => Err(CacheError::StampedeTimeout(key.to_string())),
            },
            Err(tx) => {
                let guard = SlotGuard {
                    inflight: &self.inflight,
                    key,
                };
                let result = f().await;
                drop(guard);
                if tx.receiver_count() > 0 {
                    let _ = tx.send(result.clone());
                }
                result
            }
        }
    }

    /// Await an in-flight fetch for `key`, if any
    pub async fn await_pending(&self, key: &str) -> Option<FlightResult> {
        let mut rx = {
            let sender = self.inflight.get(key)?;
            sender.subscribe()
        };
        match tokio::time::timeout(self.timeout, rx.recv()).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => None,
            Err(_) => Some(Err(CacheError::StampedeTimeout(key.to_string()))),
        }
    }
}
