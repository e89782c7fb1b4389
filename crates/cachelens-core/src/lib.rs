//! # cachelens-core
//!
//! Core types, errors, and utilities shared by the cachelens crates.
//!
//! This crate provides:
//! - [`CacheLensError`] - Error type for configuration, I/O and parsing failures
//! - [`logging`] - Tracing setup and log management utilities
//! - [`types`] - Usage records, messages and request descriptors
//! - [`config`] - YAML configuration for waste detection, metadata lookup and pricing
//!
//! ## Example
//!
//! ```no_run
//! use cachelens_core::{CacheLensConfig, logging};
//!
//! fn main() -> cachelens_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!
//!     let config = CacheLensConfig::load_default()?;
//!     tracing::info!(threshold = config.waste_detection.threshold, "config loaded");
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-export main types for convenience
pub use config::{CacheLensConfig, MetadataConfig, PricingConfig, TierOverride, WasteDetectionConfig};
pub use error::{CacheLensError, Result};
pub use logging::{LogGuard, init_logging};
pub use types::{
    CacheOutcome, Message, PersistedUsage, RequestDescriptor, Role, UsageRecord,
};
