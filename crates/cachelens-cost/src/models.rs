//! Data models for the cost model.

use serde::{Deserialize, Serialize};

use crate::error::{CostError, Result};

/// Prices for one model tier, in USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    /// Display name (e.g., "claude-sonnet")
    pub name: String,

    /// Lowercase substrings; the tier matches if any appears in the model id
    pub patterns: Vec<String>,

    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: f64,
    pub cache_read_per_million: f64,
}

impl PriceTier {
    /// Create a tier with cache pricing derived from the input price
    /// (write at 1.25x, read at 0.1x).
    pub fn new(name: impl Into<String>, input: f64, output: f64) -> Self {
        Self {
            name: name.into(),
            patterns: Vec::new(),
            input_per_million: input,
            output_per_million: output,
            cache_write_per_million: input * 1.25,
            cache_read_per_million: input * 0.1,
        }
    }

    /// Set explicit cache write/read prices.
    pub fn with_cache(mut self, write: f64, read: f64) -> Self {
        self.cache_write_per_million = write;
        self.cache_read_per_million = read;
        self
    }

    /// Add a match pattern.
    pub fn matching(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into().to_lowercase());
        self
    }

    /// Returns true if this tier applies to the (lowercased) model id.
    pub fn matches(&self, model_lower: &str) -> bool {
        self.patterns.iter().any(|p| model_lower.contains(p.as_str()))
    }

    /// Check that the tier can be used for pricing.
    pub fn validate(&self) -> Result<()> {
        if self.patterns.is_empty() || self.patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(CostError::InvalidTier {
                pattern: self.name.clone(),
                message: "tier needs at least one non-empty pattern".to_string(),
            });
        }

        let prices = [
            self.input_per_million,
            self.output_per_million,
            self.cache_write_per_million,
            self.cache_read_per_million,
        ];
        if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(CostError::InvalidTier {
                pattern: self.name.clone(),
                message: "prices must be finite and non-negative".to_string(),
            });
        }

        Ok(())
    }
}

/// Cost of one request split by billing category.
///
/// All fields are non-negative except `savings`, which goes negative when
/// cache-write overhead exceeds the read discount.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Name of the tier used for pricing
    pub tier: String,

    /// Non-cached input tokens at the input rate
    pub input_cost: f64,

    /// Output tokens at the output rate
    pub output_cost: f64,

    /// Cache creation tokens at the write rate
    pub cache_write_cost: f64,

    /// Cache read tokens at the read rate
    pub cache_read_cost: f64,

    /// Sum of the four categories
    pub total_cost: f64,

    /// Cost had every input token been billed at the input rate
    pub cost_without_cache: f64,

    /// `cost_without_cache - total_cost`
    pub savings: f64,
}

impl CostBreakdown {
    /// Returns true if caching made this request more expensive.
    pub fn is_net_loss(&self) -> bool {
        self.savings < 0.0
    }
}
