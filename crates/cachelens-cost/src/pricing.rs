//! Price tables and the cost function.
//!
//! Tiers are matched in order against the lowercased model identifier, so
//! dated or versioned sub-variants (e.g. `opus-4-5`) must precede the family
//! fallback (`opus`). Unmatched models are priced with the default tier.

use cachelens_core::{TierOverride, UsageRecord};
use tracing::trace;

use crate::error::Result;
use crate::models::{CostBreakdown, PriceTier};

const PER_MILLION: f64 = 1_000_000.0;

/// Built-in Claude price tiers, most specific first (USD per million tokens).
pub fn default_tiers() -> Vec<PriceTier> {
    vec![
        PriceTier::new("claude-opus-4.5", 5.0, 25.0)
            .with_cache(6.25, 0.50)
            .matching("opus-4-5")
            .matching("opus-4.5"),
        PriceTier::new("claude-opus", 15.0, 75.0)
            .with_cache(18.75, 1.50)
            .matching("opus"),
        PriceTier::new("claude-haiku-4.5", 1.0, 5.0)
            .with_cache(1.25, 0.10)
            .matching("haiku-4-5")
            .matching("haiku-4.5"),
        PriceTier::new("claude-haiku-3.5", 0.80, 4.0)
            .with_cache(1.0, 0.08)
            .matching("3-5-haiku")
            .matching("3.5-haiku")
            .matching("haiku-3-5"),
        PriceTier::new("claude-haiku", 0.25, 1.25)
            .with_cache(0.30, 0.03)
            .matching("haiku"),
        PriceTier::new("claude-sonnet", 3.0, 15.0)
            .with_cache(3.75, 0.30)
            .matching("sonnet"),
    ]
}

/// Tier used when no pattern matches.
pub fn default_fallback_tier() -> PriceTier {
    PriceTier::new("default", 3.0, 15.0).with_cache(3.75, 0.30)
}

/// Ordered list of price tiers plus a fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    tiers: Vec<PriceTier>,
    fallback: PriceTier,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            fallback: default_fallback_tier(),
        }
    }
}

impl PriceTable {
    /// Create a table from explicit tiers and fallback.
    pub fn new(tiers: Vec<PriceTier>, fallback: PriceTier) -> Result<Self> {
        for tier in &tiers {
            tier.validate()?;
        }
        Ok(Self { tiers, fallback })
    }

    /// Built-in table with user tiers checked first.
    pub fn with_overrides(overrides: &[TierOverride]) -> Result<Self> {
        let mut tiers: Vec<PriceTier> = overrides
            .iter()
            .map(|o| {
                PriceTier::new(o.pattern.clone(), o.input, o.output)
                    .with_cache(o.cache_write, o.cache_read)
                    .matching(o.pattern.clone())
            })
            .collect();
        tiers.extend(default_tiers());
        Self::new(tiers, default_fallback_tier())
    }

    /// Tiers in match order.
    pub fn tiers(&self) -> &[PriceTier] {
        &self.tiers
    }

    /// Resolve the tier for a model identifier.
    pub fn tier_for(&self, model: &str) -> &PriceTier {
        let lower = model.to_lowercase();
        self.tiers
            .iter()
            .find(|t| t.matches(&lower))
            .unwrap_or(&self.fallback)
    }

    /// Price a usage record against this table.
    pub fn cost(&self, usage: &UsageRecord) -> CostBreakdown {
        cost(usage, self)
    }
}

/// Compute the cost breakdown of one usage record.
///
/// Non-cached input is `input_tokens - cache_read_input_tokens`, floored at
/// zero. `cost_without_cache` bills non-cached, read and written input at
/// the plain input rate.
pub fn cost(usage: &UsageRecord, table: &PriceTable) -> CostBreakdown {
    let tier = table.tier_for(&usage.model);

    let uncached = usage
        .input_tokens
        .saturating_sub(usage.cache_read_input_tokens);
    let read = usage.cache_read_input_tokens;
    let write = usage.cache_creation_input_tokens;

    let input_cost = uncached as f64 * tier.input_per_million / PER_MILLION;
    let output_cost = usage.output_tokens as f64 * tier.output_per_million / PER_MILLION;
    let cache_write_cost = write as f64 * tier.cache_write_per_million / PER_MILLION;
    let cache_read_cost = read as f64 * tier.cache_read_per_million / PER_MILLION;
    let total_cost = input_cost + output_cost + cache_write_cost + cache_read_cost;

    let full_input = uncached + read + write;
    let cost_without_cache = full_input as f64 * tier.input_per_million / PER_MILLION + output_cost;

    trace!(model = %usage.model, tier = %tier.name, total_cost, "priced usage");

    CostBreakdown {
        tier: tier.name.clone(),
        input_cost,
        output_cost,
        cache_write_cost,
        cache_read_cost,
        total_cost,
        cost_without_cache,
        savings: cost_without_cache - total_cost,
    }
}
