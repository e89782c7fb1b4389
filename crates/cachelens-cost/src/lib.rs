//! # cachelens-cost
//!
//! Cost model for prompt-cached Claude requests.
//!
//! This crate provides:
//! - [`PriceTable`] - Ordered model tiers with a default fallback
//! - [`cost`] - Pure function from a usage record to a [`CostBreakdown`]
//!
//! ## Example
//!
//! ```
//! use cachelens_core::UsageRecord;
//! use cachelens_cost::PriceTable;
//!
//! let table = PriceTable::default();
//! let usage = UsageRecord::new("claude-sonnet-4-5")
//!     .with_tokens(2_000, 300)
//!     .with_cache(1_500, 0);
//!
//! let breakdown = table.cost(&usage);
//! assert!(breakdown.savings > 0.0);
//! ```

pub mod error;
pub mod models;
pub mod pricing;

// Re-export main types
pub use error::{CostError, Result};
pub use models::{CostBreakdown, PriceTier};
pub use pricing::{PriceTable, cost, default_tiers};
