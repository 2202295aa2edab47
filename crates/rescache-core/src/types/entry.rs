//! Cache entry type

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Version of the persisted entry layout. Bumped on incompatible change;
/// stores delete entries they cannot decode.
pub const ENTRY_SCHEMA_VERSION: u32 = 1;

/// A cached entry with full metadata
///
/// The value is opaque bytes produced by a [`crate::Serializer`]; when the
/// `compressed` flag is set the bytes are gzip output and `original_size`
/// records the pre-compression length. The serde form is self-describing so
/// a store can recover entries after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached value bytes
    pub value: Vec<u8>,
    /// When the entry was created
    pub created_at: SystemTime,
    /// When the entry expires
    pub expires_at: SystemTime,
    /// Originally requested time-to-live
    pub ttl: Duration,
    /// Tags for collective invalidation
    pub tags: Vec<String>,
    /// Number of times the entry was read
    pub hit_count: u64,
    /// Last access instant
    pub last_accessed: SystemTime,
    /// Stored byte size (post-compression when applied)
    pub size: usize,
    /// Whether `value` holds compressed bytes
    pub compressed: bool,
    /// Pre-compression size, when compressed
    pub original_size: Option<usize>,
    /// Persisted layout version
    pub schema_version: u32,
}

impl CacheEntry {
    /// Create a new entry expiring `ttl` from now
    pub fn new(value: Vec<u8>, ttl: Duration, tags: Vec<String>) -> Self {
        let now = SystemTime::now();
        let size = value.len();
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
            ttl,
            tags,
            hit_count: 0,
            last_accessed: now,
            size,
            compressed: false,
            original_size: None,
            schema_version: ENTRY_SCHEMA_VERSION,
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }

    /// Age since creation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed().unwrap_or_default()
    }

    /// Remaining lifetime (zero when expired)
    pub fn remaining(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or_default()
    }

    /// Record a read: bump the hit counter and last-access instant
    pub fn touch(&mut self) {
        self.hit_count += 1;
        self.last_accessed = SystemTime::now();
    }

    /// Replace the value with its compressed form
    pub fn mark_compressed(&mut self, compressed: Vec<u8>) {
        self.original_size = Some(self.value.len());
        self.size = compressed.len();
        self.value = compressed;
        self.compressed = true;
    }

    /// Replace the value with its decompressed form, keeping the flag and
    /// original-size metadata intact
    pub fn with_decompressed(mut self, decompressed: Vec<u8>) -> Self {
        self.value = decompressed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_invariants() {
        let entry = CacheEntry::new(b"payload".to_vec(), Duration::from_secs(60), vec![]);
        assert!(entry.expires_at > entry.created_at);
        assert_eq!(
            entry.expires_at,
            entry.created_at + Duration::from_secs(60)
        );
        assert!(entry.last_accessed >= entry.created_at);
        assert!(entry.size > 0);
        assert_eq!(entry.hit_count, 0);
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_expired_entry() {
        let mut entry = CacheEntry::new(b"x".to_vec(), Duration::from_secs(60), vec![]);
        entry.expires_at = SystemTime::now() - Duration::from_secs(1);
        assert!(entry.is_expired());
        assert_eq!(entry.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_touch() {
        let mut entry = CacheEntry::new(b"x".to_vec(), Duration::from_secs(60), vec![]);
        entry.touch();
        entry.touch();
        assert_eq!(entry.hit_count, 2);
        assert!(entry.last_accessed >= entry.created_at);
    }

    #[test]
    fn test_serde_roundtrip_is_identity() {
        let mut entry = CacheEntry::new(
            b"a moderately sized payload".to_vec(),
            Duration::from_millis(90_500),
            vec!["company".to_string(), "list".to_string()],
        );
        entry.touch();

        let encoded = serde_json::to_vec(&entry).unwrap();
        let decoded: CacheEntry = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn test_mark_compressed() {
        let mut entry = CacheEntry::new(vec![0u8; 2048], Duration::from_secs(60), vec![]);
        entry.mark_compressed(vec![1u8; 100]);
        assert!(entry.compressed);
        assert_eq!(entry.size, 100);
        assert_eq!(entry.original_size, Some(2048));
    }
}
