//! Remote key-value store over the Redis protocol

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::{AsyncCommands, Script, Value};

use rescache_core::{
    CacheEntry, CacheError, CacheStore, Compressor, GzipCompressor, RemoteKvConfig, Result,
    StoreHealth, StoreSize, DEFAULT_COMPRESSION_THRESHOLD,
};

use super::scripts;

/// Tag sets outlive their entries by this much.
const TAG_SET_EXTRA_TTL: Duration = Duration::from_secs(3600);

/// Remote-KV cache store
///
/// Keys are written as `<prefix><key>` and returned stripped; tag sets live
/// at `<prefix>tags:<tag>` holding unprefixed member keys. Atomicity of
/// entry+tag updates uses server-side scripting when enabled, else
/// pipelined batches (briefly non-atomic tag maintenance is tolerated).
#[derive(Clone)]
pub struct RemoteKvStore {
    pool: Pool<RedisConnectionManager>,
    config: RemoteKvConfig,
    prefix: String,
    compressor: GzipCompressor,
    get_script: Script,
    set_script: Script,
    delete_tags_script: Script,
    delete_pattern_script: Script,
}

impl RemoteKvStore {
    /// Connect to the remote store. The pool reconnects lazily; a dead
    /// server surfaces as `Connectivity` errors from individual operations.
    pub async fn connect(config: RemoteKvConfig, key_prefix: impl Into<String>) -> Result<Self> {
        Self::connect_with_threshold(config, key_prefix, DEFAULT_COMPRESSION_THRESHOLD).await
    }

    /// Connect with an explicit compression threshold
    pub async fn connect_with_threshold(
        config: RemoteKvConfig,
        key_prefix: impl Into<String>,
        compression_threshold: usize,
    ) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url().as_str())
            .map_err(|e| CacheError::Connectivity(e.to_string()))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.connect_timeout)
            .build(manager)
            .await
            .map_err(|e| CacheError::Connectivity(e.to_string()))?;

        Ok(Self {
            pool,
            config,
            prefix: key_prefix.into(),
            compressor: GzipCompressor::default().with_threshold(compression_threshold),
            get_script: Script::new(scripts::GET_CHECK_TTL),
            set_script: Script::new(scripts::SET_WITH_TAGS),
            delete_tags_script: Script::new(scripts::DELETE_BY_TAGS),
            delete_pattern_script: Script::new(scripts::DELETE_BY_PATTERN),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.prefix).unwrap_or(key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tags:{}", self.prefix, tag)
    }

    fn tag_pattern(&self) -> String {
        format!("{}tags:*", self.prefix)
    }

    async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connectivity(e.to_string()))
    }

    fn encode(&self, entry: &CacheEntry) -> Result<Vec<u8>> {
        serde_json::to_vec(entry).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn entry_ttl_secs(entry: &CacheEntry) -> u64 {
        entry.remaining().as_secs().max(1)
    }

    /// Persist a hit-count bump without blocking the read path.
    fn spawn_stats_update(&self, key: String, entry: CacheEntry) {
        let pool = self.pool.clone();
        let prefixed = self.prefixed(&key);
        tokio::spawn(async move {
            let Ok(mut conn) = pool.get().await else {
                return;
            };
            if let Ok(bytes) = serde_json::to_vec(&entry) {
                let result: std::result::Result<Value, _> = redis::cmd("SET")
                    .arg(&prefixed)
                    .arg(bytes)
                    .arg("KEEPTTL")
                    .query_async(&mut *conn)
                    .await;
                if let Err(e) = result {
                    tracing::debug!(key, error = %e, "hit-count update dropped");
                }
            }
        });
    }

    async fn scan_keys(&self, match_pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(match_pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// Scan prefixed entry keys (tag sets excluded).
    async fn scan_entry_keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let match_pattern = match pattern {
            Some(p) => format!("{}{}", self.prefix, p),
            None => format!("{}*", self.prefix),
        };
        let tag_prefix = format!("{}tags:", self.prefix);
        Ok(self
            .scan_keys(&match_pattern)
            .await?
            .into_iter()
            .filter(|k| !k.starts_with(&tag_prefix))
            .collect())
    }
}

#[async_trait]
impl CacheStore for RemoteKvStore {
    fn name(&self) -> &'static str {
        "remote_kv"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn().await?;
        let prefixed = self.prefixed(key);

        let bytes: Option<Vec<u8>> = if self.config.enable_scripting {
            self.get_script
                .key(&prefixed)
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?
        } else {
            conn.get(&prefixed)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?
        };

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let mut entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(_) => {
                // Undecodable entry: treat as a miss and drop it.
                let _: u64 = conn
                    .del(&prefixed)
                    .await
                    .map_err(|e| CacheError::Backend(e.to_string()))?;
                return Ok(None);
            }
        };

        if entry.is_expired() {
            let _: u64 = conn
                .del(&prefixed)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            return Ok(None);
        }

        entry.touch();
        self.spawn_stats_update(key.to_string(), entry.clone());

        if entry.compressed {
            match self.compressor.decompress(&entry.value) {
                Ok(decompressed) => Ok(Some(entry.with_decompressed(decompressed))),
                Err(_) => {
                    let _: u64 = conn
                        .del(&prefixed)
                        .await
                        .map_err(|e| CacheError::Backend(e.to_string()))?;
                    Ok(None)
                }
            }
        } else {
            Ok(Some(entry))
        }
    }

    async fn set(&self, key: &str, mut entry: CacheEntry) -> Result<()> {
        if !entry.compressed && self.compressor.should_compress(&entry.value) {
            let compressed = self.compressor.compress(&entry.value)?;
            entry.mark_compressed(compressed);
        }

        let payload = self.encode(&entry)?;
        let prefixed = self.prefixed(key);
        let ttl_secs = Self::entry_ttl_secs(&entry);
        let tag_ttl_secs = ttl_secs + TAG_SET_EXTRA_TTL.as_secs();
        let mut conn = self.conn().await?;

        if self.config.enable_scripting {
            let mut invocation = self.set_script.prepare_invoke();
            invocation.key(&prefixed);
            for tag in &entry.tags {
                invocation.key(self.tag_key(tag));
            }
            invocation
                .arg(payload)
                .arg(ttl_secs)
                .arg(tag_ttl_secs)
                .arg(key);
            let _: i64 = invocation
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
        } else {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.set_ex(&prefixed, payload, ttl_secs);
            for tag in &entry.tags {
                let tag_k = self.tag_key(tag);
                pipe.sadd(&tag_k, key);
                pipe.expire(&tag_k, tag_ttl_secs as i64);
            }
            pipe.query_async::<Vec<Value>>(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let prefixed = self.prefixed(key);

        // Resolve tags first so the sets can be pruned alongside the entry.
        let bytes: Option<Vec<u8>> = conn
            .get(&prefixed)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        let tags: Vec<String> = bytes
            .as_deref()
            .and_then(|b| serde_json::from_slice::<CacheEntry>(b).ok())
            .map(|e| e.tags)
            .unwrap_or_default();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&prefixed);
        for tag in &tags {
            pipe.srem(self.tag_key(tag), key);
        }
        let results: Vec<Value> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let deleted = matches!(results.first(), Some(Value::Int(n)) if *n > 0);
        Ok(deleted)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed(k)).collect();
        let count: u64 = conn
            .del(&prefixed)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(count)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        let match_pattern = format!("{}{}", self.prefix, pattern);
        if self.config.enable_scripting {
            let mut conn = self.conn().await?;
            let deleted: i64 = self
                .delete_pattern_script
                .arg(&match_pattern)
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            return Ok(deleted.max(0) as u64);
        }

        let keys = self.scan_keys(&match_pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let count: u64 = conn
            .unlink(&keys)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(count)
    }

    async fn delete_by_tags(&self, tags: &[String]) -> Result<u64> {
        if tags.is_empty() {
            return Ok(0);
        }
        if self.config.enable_scripting {
            let mut conn = self.conn().await?;
            let mut invocation = self.delete_tags_script.prepare_invoke();
            for tag in tags {
                invocation.key(self.tag_key(tag));
            }
            invocation.arg(&self.prefix).arg(self.tag_pattern());
            let deleted: i64 = invocation
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            return Ok(deleted.max(0) as u64);
        }

        // Pipelined fallback: briefly non-atomic between SMEMBERS and DEL.
        let mut members: Vec<String> = Vec::new();
        {
            let mut conn = self.conn().await?;
            for tag in tags {
                let tag_k = self.tag_key(tag);
                let keys: Vec<String> = conn
                    .smembers(&tag_k)
                    .await
                    .map_err(|e| CacheError::Backend(e.to_string()))?;
                for key in keys {
                    if !members.contains(&key) {
                        members.push(key);
                    }
                }
            }
        }
        let deleted = self.delete_many(&members).await?;
        let mut conn = self.conn().await?;
        let tag_keys: Vec<String> = tags.iter().map(|t| self.tag_key(t)).collect();
        let _: u64 = conn
            .del(&tag_keys)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(deleted)
    }

    async fn keys_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.smembers(self.tag_key(tag))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exists(self.prefixed(key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn clear(&self) -> Result<()> {
        let keys = self.scan_keys(&format!("{}*", self.prefix)).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: u64 = conn
            .unlink(&keys)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .scan_entry_keys(pattern)
            .await?
            .iter()
            .map(|k| self.strip_prefix(k).to_string())
            .collect())
    }

    async fn size(&self) -> Result<StoreSize> {
        let keys = self.scan_entry_keys(None).await?;
        let mut bytes = 0usize;
        let mut conn = self.conn().await?;
        for chunk in keys.chunks(100) {
            let mut pipe = redis::pipe();
            for key in chunk {
                pipe.strlen(key);
            }
            let lens: Vec<usize> = pipe
                .query_async(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            bytes += lens.iter().sum::<usize>();
        }
        Ok(StoreSize {
            entries: keys.len(),
            bytes,
        })
    }

    async fn cleanup(&self) -> Result<u64> {
        // The server expires entries on its own; this pass only reaps
        // entries whose embedded expiry disagrees with the server TTL.
        let keys = self.scan_entry_keys(None).await?;
        let mut removed = 0;
        let mut conn = self.conn().await?;
        for key in &keys {
            let bytes: Option<Vec<u8>> = conn
                .get(key)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            let expired = bytes
                .as_deref()
                .and_then(|b| serde_json::from_slice::<CacheEntry>(b).ok())
                .is_some_and(|e| e.is_expired());
            if expired {
                let n: u64 = conn
                    .del(key)
                    .await
                    .map_err(|e| CacheError::Backend(e.to_string()))?;
                removed += n;
            }
        }
        Ok(removed)
    }

    async fn expired_count(&self) -> Result<u64> {
        let keys = self.scan_entry_keys(None).await?;
        let mut count = 0;
        let mut conn = self.conn().await?;
        for key in &keys {
            let bytes: Option<Vec<u8>> = conn
                .get(key)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            if bytes
                .as_deref()
                .and_then(|b| serde_json::from_slice::<CacheEntry>(b).ok())
                .is_some_and(|e| e.is_expired())
            {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn health(&self) -> Result<StoreHealth> {
        let start = Instant::now();
        let probe_key = "__health_probe__";
        let entry = CacheEntry::new(b"ok".to_vec(), Duration::from_secs(5), vec![]);
        let healthy = match self.set(probe_key, entry).await {
            Ok(()) => {
                let read = self.get(probe_key).await?;
                let _ = self.delete(probe_key).await;
                read.is_some_and(|e| e.value == b"ok")
            }
            Err(_) => false,
        };
        Ok(StoreHealth {
            healthy,
            latency: start.elapsed(),
            error: (!healthy).then(|| "probe round-trip failed".to_string()),
        })
    }

    async fn close(&self) -> Result<()> {
        // The pool drops connections on its own; nothing to flush.
        Ok(())
    }
}
