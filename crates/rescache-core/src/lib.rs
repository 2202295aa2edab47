//! rescache-core: Core traits and types for the rescache library
//!
//! This crate provides the foundational types and traits used throughout
//! the rescache ecosystem: the request context and cache entry data model,
//! the store capability trait, the event sink, and the pluggable
//! serialization and compression seams.

mod compression;
mod error;
mod pattern;
mod serializer;
mod traits;
mod types;

pub use compression::{
    Compressor, GzipCompressor, NoopCompressor, DEFAULT_COMPRESSION_THRESHOLD,
};
pub use error::{CacheError, Result};
pub use pattern::glob_match;
pub use serializer::{JsonSerializer, Serializer};
pub use traits::*;
pub use types::*;
