//! # cachelens-stream
//!
//! Usage extraction and pass-through tapping of LLM response streams.
//!
//! This crate provides:
//! - [`extractor`] - Normalizes `message_start`, `message_delta` and
//!   OpenAI-style usage payloads into a [`UsageRecord`](cachelens_core::UsageRecord)
//! - [`sse`] - Incremental SSE frame splitting and chunk-safe UTF-8 decoding
//! - [`tap`] - [`tap_stream`], which forwards bytes unchanged while extracting usage
//! - [`metadata`] - Fallback lookup of cache counters from a gateway's generation endpoint

pub mod error;
pub mod extractor;
pub mod metadata;
pub mod sse;
pub mod tap;

// Re-export main types
pub use error::{Result, StreamError};
pub use extractor::{
    ExtractedUsage, UsageAccumulator, UsageShape, extract_from_body, extract_from_payload,
    extract_usage,
};
pub use metadata::{CacheCounters, MetadataClient};
pub use sse::{FrameSplitter, Utf8Decoder};
pub use tap::{ByteStream, StreamTap, TapMode, TapOutcome, TapSink, tap_stream};
