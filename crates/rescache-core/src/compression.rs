//! Compression support for cached values
//!
//! Values over a byte threshold are gzipped before they reach the remote-KV
//! or file store. Compression failures map to `Serialization` errors: a
//! value that cannot be encoded is treated the same as one that cannot be
//! serialized.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::CacheError;

/// Default byte threshold below which values are stored uncompressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Trait for compression implementations
pub trait Compressor: Send + Sync + Clone + 'static {
    /// Name of the compressor
    fn name(&self) -> &str;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError>;

    /// Check if data should be compressed (based on size threshold)
    fn should_compress(&self, data: &[u8]) -> bool {
        data.len() >= DEFAULT_COMPRESSION_THRESHOLD
    }
}

/// No-op compressor (disabled compression)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn name(&self) -> &str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        Ok(data.to_vec())
    }

    fn should_compress(&self, _data: &[u8]) -> bool {
        false
    }
}

/// Gzip compressor
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    level: u32,
    threshold: usize,
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new(6)
    }
}

impl GzipCompressor {
    /// Create a new gzip compressor with the given compression level (0-9)
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }

    /// Set the byte threshold for compression
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Get the compression level
    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Compressor for GzipCompressor {
    fn name(&self) -> &str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| CacheError::Serialization(format!("gzip encode: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CacheError::Serialization(format!("gzip decode: {e}")))?;
        Ok(out)
    }

    fn should_compress(&self, data: &[u8]) -> bool {
        data.len() >= self.threshold
    }
}
