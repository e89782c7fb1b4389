//! Typed session events for renderers.
//!
//! The aggregator never renders anything itself; UIs, loggers and the CLI
//! subscribe to these over a broadcast channel.

use cachelens_diagnosis::DiagnosisResult;

use crate::history::HistoryEntry;
use crate::stats::SessionStats;

/// Default broadcast buffer size.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by the session aggregator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A request was folded into the session.
    UsageProcessed {
        /// The new history entry
        entry: Box<HistoryEntry>,
        /// Counters after the update
        stats: SessionStats,
    },

    /// A cache miss was diagnosed.
    DiagnosisReady {
        /// Sequence number of the history entry carrying the diagnosis
        sequence: u64,
        diagnosis: Box<DiagnosisResult>,
    },

    /// The consecutive-miss streak reached the configured threshold.
    WasteDetected {
        consecutive_misses: u32,
        threshold: u32,
        /// Cache-write cost accumulated over the streak
        streak_write_cost: f64,
    },

    /// Counters and history were cleared.
    StatsReset,
}

impl SessionEvent {
    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UsageProcessed { .. } => "usage_processed",
            Self::DiagnosisReady { .. } => "diagnosis_ready",
            Self::WasteDetected { .. } => "waste_detected",
            Self::StatsReset => "stats_reset",
        }
    }
}
