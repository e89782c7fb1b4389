//! Session aggregation.
//!
//! [`SessionAggregator`] owns everything that outlives a single request: the
//! running counters, the history ring, and the one previous-request snapshot
//! that the next miss is diagnosed against. Each call to
//! [`SessionAggregator::process`] classifies the request, prices it,
//! diagnoses it when it wrote to the cache without reading, and then
//! replaces the previous snapshot with the current one.
//!
//! Requests are assumed to complete in dispatch order. When a slow response
//! lands after a faster, later one, the snapshot comparison is against the
//! wrong request; this is accepted rather than corrected.

use std::panic::{AssertUnwindSafe, catch_unwind};

use cachelens_core::{CacheLensConfig, CacheOutcome, UsageRecord, log_diagnosis_event, log_usage_event};
use cachelens_cost::PriceTable;
use cachelens_diagnosis::{DiagnosisResult, MissDiagnoser, RequestSnapshot};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::events::{EVENT_CHANNEL_CAPACITY, SessionEvent};
use crate::history::{HistoryEntry, HistoryRing};
use crate::stats::SessionStats;

/// Aggregator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Emit waste warnings
    pub waste_detection_enabled: bool,
    /// Consecutive write-misses that trigger a warning
    pub waste_threshold: u32,
    /// History ring capacity
    pub history_capacity: usize,
    /// Broadcast buffer size
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&CacheLensConfig::default())
    }
}

impl SessionConfig {
    /// Derive session settings from the loaded configuration file.
    pub fn from_config(config: &CacheLensConfig) -> Self {
        Self {
            waste_detection_enabled: config.waste_detection.enabled,
            waste_threshold: config.waste_detection.threshold,
            history_capacity: config.history_capacity,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }

    /// Set the waste threshold.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.waste_threshold = threshold;
        self
    }
}

/// Process-wide cache performance state.
pub struct SessionAggregator {
    config: SessionConfig,
    prices: PriceTable,
    diagnoser: MissDiagnoser,
    stats: SessionStats,
    history: HistoryRing,
    previous: Option<RequestSnapshot>,
    streak_write_cost: f64,
    sequence: u64,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAggregator")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .field("history_len", &self.history.len())
            .field("has_previous", &self.previous.is_some())
            .finish()
    }
}

impl SessionAggregator {
    pub fn new(config: SessionConfig, prices: PriceTable, diagnoser: MissDiagnoser) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let history = HistoryRing::new(config.history_capacity);
        Self {
            config,
            prices,
            diagnoser,
            stats: SessionStats::default(),
            history,
            previous: None,
            streak_write_cost: 0.0,
            sequence: 0,
            events,
        }
    }

    /// Fold one completed request into the session.
    ///
    /// Returns `None` when the record is not from a Claude model; such
    /// records leave every counter and the previous snapshot untouched.
    pub fn process(
        &mut self,
        record: UsageRecord,
        current: RequestSnapshot,
        response_time_ms: u64,
    ) -> Option<&HistoryEntry> {
        if !record.is_claude() {
            debug!(model = %record.model, "ignoring usage from non-Claude model");
            return None;
        }

        let costs = self.prices.cost(&record);
        let outcome = self.stats.record(&record, &costs);
        self.sequence += 1;

        log_usage_event!(
            sequence = self.sequence,
            model = %record.model,
            outcome = %outcome,
            input = record.input_tokens,
            output = record.output_tokens,
            cache_read = record.cache_read_input_tokens,
            cache_write = record.cache_creation_input_tokens,
            cost = costs.total_cost,
            savings = costs.savings
        );

        let diagnosis = match outcome {
            CacheOutcome::WriteMiss => Some(self.run_diagnosis(&current)),
            _ => None,
        };

        let fingerprints = current.fingerprints.clone();
        let message_count = current.len();
        let timestamp = current.timestamp;
        self.previous = Some(current);

        match outcome {
            CacheOutcome::Hit => self.streak_write_cost = 0.0,
            CacheOutcome::WriteMiss => {
                self.streak_write_cost += costs.cache_write_cost;
                self.check_waste();
            }
            CacheOutcome::NoCacheActivity => {}
        }

        let entry = HistoryEntry {
            sequence: self.sequence,
            timestamp,
            response_time_ms,
            usage: record,
            outcome,
            cache_hit: outcome == CacheOutcome::Hit,
            cache_write: outcome == CacheOutcome::WriteMiss,
            costs,
            diagnosis,
            fingerprints,
            message_count,
        };

        if let Some(diagnosis) = &entry.diagnosis {
            self.emit(SessionEvent::DiagnosisReady {
                sequence: entry.sequence,
                diagnosis: Box::new(diagnosis.clone()),
            });
        }
        self.emit(SessionEvent::UsageProcessed {
            entry: Box::new(entry.clone()),
            stats: self.stats.clone(),
        });

        if let Some(evicted) = self.history.push(entry) {
            debug!(sequence = evicted.sequence, "evicted oldest history entry");
        }
        self.history.latest()
    }

    /// Diagnose against the stored snapshot, never letting a panic escape.
    fn run_diagnosis(&self, current: &RequestSnapshot) -> DiagnosisResult {
        let previous = self.previous.as_ref();
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.diagnoser.diagnose(previous, current)
        }));

        match result {
            Ok(diagnosis) => {
                log_diagnosis_event!(
                    sequence = self.sequence,
                    reasons = diagnosis.reasons.len(),
                    ttl_warning = diagnosis.ttl_warning,
                    location = ?diagnosis.location_analysis.as_ref().map(|l| l.location),
                    primary = ?diagnosis.primary_diagnosis.as_ref().map(|p| p.issue)
                );
                diagnosis
            }
            Err(_) => {
                error!(sequence = self.sequence, "diagnosis panicked; recording an empty result");
                DiagnosisResult::default()
            }
        }
    }

    fn check_waste(&mut self) {
        if !self.config.waste_detection_enabled
            || self.stats.consecutive_misses != self.config.waste_threshold
        {
            return;
        }

        self.stats.waste_warnings += 1;
        warn!(
            consecutive_misses = self.stats.consecutive_misses,
            threshold = self.config.waste_threshold,
            streak_write_cost = self.streak_write_cost,
            "repeated cache writes without reads; the prompt prefix is unstable"
        );
        self.emit(SessionEvent::WasteDetected {
            consecutive_misses: self.stats.consecutive_misses,
            threshold: self.config.waste_threshold,
            streak_write_cost: self.streak_write_cost,
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Current counters.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn history(&self) -> &HistoryRing {
        &self.history
    }

    /// Snapshot the next miss will be diagnosed against.
    pub fn previous_snapshot(&self) -> Option<&RequestSnapshot> {
        self.previous.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Clear counters, history and the previous snapshot.
    pub fn reset(&mut self) {
        self.stats = SessionStats::default();
        self.history.clear();
        self.previous = None;
        self.streak_write_cost = 0.0;
        self.sequence = 0;
        debug!("session reset");
        self.emit(SessionEvent::StatsReset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachelens_core::{Message, Role};
    use cachelens_diagnosis::{Location, PatternDetector, PatternFlags, PrimaryIssue};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).unwrap()
    }

    fn snapshot_at(messages: Vec<Message>, secs: i64) -> RequestSnapshot {
        RequestSnapshot::from_messages(messages, None, base_time() + Duration::seconds(secs))
    }

    fn chat(n: usize) -> Vec<Message> {
        let mut messages = vec![Message::new(Role::System, "Be concise.")];
        for i in 0..n {
            messages.push(Message::new(Role::User, format!("u{i}")));
            messages.push(Message::new(Role::Assistant, format!("a{i}")));
        }
        messages
    }

    fn usage(read: u64, write: u64) -> UsageRecord {
        UsageRecord::new("claude-sonnet-4-5-20250929")
            .with_tokens(50, 20)
            .with_cache(read, write)
    }

    fn aggregator(threshold: u32) -> SessionAggregator {
        SessionAggregator::new(
            SessionConfig::default().with_threshold(threshold),
            PriceTable::default(),
            MissDiagnoser::default(),
        )
    }

    #[test]
    fn test_non_claude_records_ignored() {
        let mut agg = aggregator(3);
        let gpt = UsageRecord::new("gpt-4o").with_tokens(10, 10).with_cache(0, 100);
        assert!(agg.process(gpt, snapshot_at(chat(1), 0), 10).is_none());
        assert_eq!(agg.stats().total_requests, 0);
        assert!(agg.previous_snapshot().is_none());
    }

    #[test]
    fn test_classification_and_streak() {
        let mut agg = aggregator(10);

        let entry = agg.process(usage(0, 0), snapshot_at(chat(1), 0), 10).unwrap();
        assert!(!entry.cache_hit && !entry.cache_write);
        assert!(entry.diagnosis.is_none());

        let entry = agg.process(usage(0, 800), snapshot_at(chat(1), 1), 10).unwrap();
        assert!(entry.cache_write);
        assert!(entry.diagnosis.is_some());
        assert_eq!(agg.stats().consecutive_misses, 1);

        let entry = agg.process(usage(500, 0), snapshot_at(chat(1), 2), 10).unwrap();
        assert!(entry.cache_hit);
        assert_eq!(agg.stats().consecutive_misses, 0);
        assert_eq!(agg.stats().total_cache_read_tokens, 500);
        assert_eq!(agg.stats().total_cache_write_tokens, 800);
    }

    #[test]
    fn test_waste_warning_on_third_miss() {
        let mut agg = aggregator(3);
        let mut rx = agg.subscribe();

        for i in 0..2 {
            agg.process(usage(0, 900), snapshot_at(chat(1), i), 10);
            assert_eq!(agg.stats().waste_warnings, 0);
        }
        agg.process(usage(0, 900), snapshot_at(chat(1), 2), 10);
        assert_eq!(agg.stats().waste_warnings, 1);

        // a fourth miss does not re-fire at the same crossing
        agg.process(usage(0, 900), snapshot_at(chat(1), 3), 10);
        assert_eq!(agg.stats().waste_warnings, 1);

        let mut waste_events = 0;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::WasteDetected { consecutive_misses, streak_write_cost, .. } = event {
                assert_eq!(consecutive_misses, 3);
                assert!(streak_write_cost > 0.0);
                waste_events += 1;
            }
        }
        assert_eq!(waste_events, 1);

        // a hit re-arms the warning
        agg.process(usage(100, 0), snapshot_at(chat(1), 4), 10);
        for i in 5..8 {
            agg.process(usage(0, 900), snapshot_at(chat(1), i), 10);
        }
        assert_eq!(agg.stats().waste_warnings, 2);
    }

    #[test]
    fn test_waste_detection_disabled() {
        let mut config = SessionConfig::default().with_threshold(1);
        config.waste_detection_enabled = false;
        let mut agg = SessionAggregator::new(config, PriceTable::default(), MissDiagnoser::default());
        agg.process(usage(0, 900), snapshot_at(chat(1), 0), 10);
        assert_eq!(agg.stats().waste_warnings, 0);
    }

    #[test]
    fn test_history_ring_eviction() {
        let mut agg = aggregator(3);
        for i in 0..101 {
            agg.process(usage(10, 0), snapshot_at(chat(1), i), 5);
        }
        assert_eq!(agg.history().len(), 100);
        assert_eq!(agg.history().oldest().unwrap().sequence, 2);
        assert!(agg.history().iter().all(|e| e.sequence != 1));
        assert_eq!(agg.stats().total_requests, 101);
    }

    #[test]
    fn test_end_to_end_ttl_and_growth() {
        let mut agg = aggregator(3);

        let first = agg
            .process(usage(0, 2000), snapshot_at(chat(2), 0), 900)
            .unwrap();
        let diagnosis = first.diagnosis.as_ref().unwrap();
        assert_eq!(diagnosis.reasons, vec!["First request - no previous cache".to_string()]);
        assert!(diagnosis.primary_diagnosis.is_none());

        let mut grown = chat(2);
        grown.push(Message::new(Role::User, "u2"));
        let second = agg
            .process(usage(0, 900), snapshot_at(grown, 400), 1200)
            .unwrap();
        let diagnosis = second.diagnosis.as_ref().unwrap();
        assert!(diagnosis.ttl_warning);
        assert!(diagnosis.reasons.iter().any(|r| r.contains("TTL expired")));
        assert_eq!(
            diagnosis.location_analysis.as_ref().unwrap().location,
            Location::Late
        );
        assert_eq!(
            diagnosis.primary_diagnosis.as_ref().unwrap().issue,
            PrimaryIssue::ChatHistoryGrowth
        );
        assert_eq!(agg.previous_snapshot().unwrap().len(), 6);
    }

    #[test]
    fn test_end_to_end_short_conversation_growth() {
        let mut agg = aggregator(3);

        let mut opening = chat(0);
        opening.push(Message::new(Role::User, "u0"));
        agg.process(usage(0, 1500), snapshot_at(opening, 0), 700);

        let mut second = chat(1);
        second.push(Message::new(Role::User, "u1"));
        let entry = agg
            .process(usage(0, 300), snapshot_at(second, 400), 800)
            .unwrap();

        let diagnosis = entry.diagnosis.as_ref().unwrap();
        assert!(diagnosis.ttl_warning);
        assert_eq!(
            diagnosis.location_analysis.as_ref().unwrap().location,
            Location::Late
        );
        assert_eq!(
            diagnosis.primary_diagnosis.as_ref().unwrap().issue,
            PrimaryIssue::ChatHistoryGrowth
        );
        assert!(!diagnosis.system_prompt_changed);
    }

    #[test]
    fn test_snapshot_replaced_after_hit() {
        let mut agg = aggregator(3);
        agg.process(usage(300, 0), snapshot_at(chat(1), 0), 10);
        agg.process(usage(300, 0), snapshot_at(chat(3), 10), 10);
        assert_eq!(agg.previous_snapshot().unwrap().len(), 7);
    }

    struct Exploding;

    impl PatternDetector for Exploding {
        fn detect(&self, _content: &str) -> PatternFlags {
            panic!("detector bug")
        }
    }

    #[test]
    fn test_panicking_detector_degrades() {
        let mut agg = SessionAggregator::new(
            SessionConfig::default(),
            PriceTable::default(),
            MissDiagnoser::new(Box::new(Exploding)),
        );
        agg.process(usage(0, 100), snapshot_at(chat(1), 0), 10);

        let mut changed = chat(1);
        changed[1] = Message::new(Role::User, "edited");
        let entry = agg.process(usage(0, 100), snapshot_at(changed, 5), 10).unwrap();
        assert_eq!(entry.diagnosis.as_ref().unwrap(), &DiagnosisResult::default());
        assert_eq!(agg.stats().total_requests, 2);
    }

    #[tokio::test]
    async fn test_events_and_reset() {
        let mut agg = aggregator(3);
        let mut rx = agg.subscribe();

        agg.process(usage(0, 400), snapshot_at(chat(1), 0), 10);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.name(), "diagnosis_ready");
        let second = rx.recv().await.unwrap();
        match second {
            SessionEvent::UsageProcessed { entry, stats } => {
                assert_eq!(entry.sequence, 1);
                assert_eq!(stats.total_requests, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }

        agg.reset();
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::StatsReset));
        assert_eq!(agg.stats(), &SessionStats::default());
        assert!(agg.history().is_empty());
        assert!(agg.previous_snapshot().is_none());
    }
}
