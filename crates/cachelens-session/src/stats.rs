//! Running session counters.

use cachelens_core::{CacheOutcome, UsageRecord};
use cachelens_cost::CostBreakdown;
use serde::Serialize;

/// Aggregate cache performance for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Write-misses since the last hit
    pub consecutive_misses: u32,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_cache_write_tokens: u64,
    /// Sum of per-request `max(input, read + write)`
    pub reconciled_input_tokens: u64,
    pub total_cost: f64,
    pub total_cost_without_cache: f64,
    pub total_savings: f64,
    pub waste_warnings: u64,
}

impl SessionStats {
    /// Fold one accepted request into the counters and return its outcome.
    ///
    /// A hit resets the consecutive-miss streak; a write-miss extends it;
    /// no cache activity leaves it alone.
    pub fn record(&mut self, usage: &UsageRecord, costs: &CostBreakdown) -> CacheOutcome {
        self.total_requests += 1;
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_cache_read_tokens += usage.cache_read_input_tokens;
        self.total_cache_write_tokens += usage.cache_creation_input_tokens;
        self.reconciled_input_tokens += usage.reconciled_input();

        self.total_cost += costs.total_cost;
        self.total_cost_without_cache += costs.cost_without_cache;
        self.total_savings += costs.savings;

        let outcome = usage.outcome();
        match outcome {
            CacheOutcome::Hit => {
                self.cache_hits += 1;
                self.consecutive_misses = 0;
            }
            CacheOutcome::WriteMiss => {
                self.cache_misses += 1;
                self.consecutive_misses = self.consecutive_misses.saturating_add(1);
            }
            CacheOutcome::NoCacheActivity => {}
        }
        outcome
    }

    /// Fraction of requests that read from the cache.
    pub fn request_hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.total_requests as f64
    }

    /// Fraction of input tokens served from the cache.
    ///
    /// The denominator reconciles each request's reported input with its
    /// cache counters, since streamed usage has been seen to under-report
    /// input. Treat this figure as provisional.
    pub fn token_hit_rate(&self) -> f64 {
        if self.reconciled_input_tokens == 0 {
            return 0.0;
        }
        self.total_cache_read_tokens as f64 / self.reconciled_input_tokens as f64
    }
}
