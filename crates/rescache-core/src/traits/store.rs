//! Cache store trait

use async_trait::async_trait;

use crate::{CacheEntry, Result, StoreHealth, StoreSize};

/// Capability set implemented by every store variant.
///
/// Failure semantics: a store distinguishes success+hit (`Ok(Some)`),
/// success+miss (`Ok(None)`), and failure (`Err`); it never reports an
/// internal error as a hit. A GET that finds an expired entry deletes it
/// lazily and reports a miss. Entries cross this boundary by value.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Store kind label, for logs and health reports
    fn name(&self) -> &'static str;

    /// Get an entry. Expired entries are removed and reported as a miss.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry under `key`, replacing any existing one.
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;

    /// Delete a key. Returns `true` if the key was present.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete each listed key. Returns how many were present.
    async fn delete_many(&self, keys: &[String]) -> Result<u64>;

    /// Delete all keys matching a `*`-wildcard pattern.
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64>;

    /// Delete the union of keys carrying any of the given tags.
    async fn delete_by_tags(&self, tags: &[String]) -> Result<u64>;

    /// Resolve the keys currently tagged with `tag`.
    async fn keys_by_tag(&self, tag: &str) -> Result<Vec<String>>;

    /// Check whether a live (unexpired) entry exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every entry and index.
    async fn clear(&self) -> Result<()>;

    /// List keys, optionally filtered by a `*`-wildcard pattern.
    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>>;

    /// Entry count and byte usage.
    async fn size(&self) -> Result<StoreSize>;

    /// Remove expired entries. Returns how many were removed.
    async fn cleanup(&self) -> Result<u64>;

    /// Count expired entries without removing them (dry-run support).
    async fn expired_count(&self) -> Result<u64>;

    /// Round-trip self test.
    async fn health(&self) -> Result<StoreHealth>;

    /// Stop background work and release resources.
    async fn close(&self) -> Result<()>;
}
