//! Bounded request history.

use std::collections::VecDeque;

use cachelens_core::{CacheOutcome, UsageRecord};
use cachelens_cost::CostBreakdown;
use cachelens_diagnosis::{DiagnosisResult, MessageFingerprint};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One processed request.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Monotonic per-session sequence number, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: u64,
    pub usage: UsageRecord,
    pub outcome: CacheOutcome,
    pub cache_hit: bool,
    pub cache_write: bool,
    pub costs: CostBreakdown,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<DiagnosisResult>,
    pub fingerprints: Vec<MessageFingerprint>,
    pub message_count: usize,
}

/// FIFO ring of the most recent entries.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryRing {
    /// Create a ring holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, returning the evicted oldest entry if the ring was full.
    pub fn push(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently appended entry.
    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    /// Oldest entry still held.
    pub fn oldest(&self) -> Option<&HistoryEntry> {
        self.entries.front()
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Entries that carry a diagnosis, newest first.
    pub fn diagnosed(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev().filter(|e| e.diagnosis.is_some())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
