//! Cache-miss diagnosis.
//!
//! Given the previous request snapshot and the current one, the diagnoser
//! runs a fixed sequence of checks:
//!
//! 1. TTL: more than five minutes since the previous request expires the cache
//! 2. Divergence: the first message whose fingerprint changed
//! 3. Lorebook order: entries reordered or swapped at the divergent message
//! 4. Location: how far into the conversation the change happened
//! 5. Primary diagnosis: one summary picked by fixed precedence
//! 6. System prompt: flagged whenever the leading system content changed
//!
//! Without a previous snapshot there is nothing to compare and the result is
//! the single "first request" reason.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::divergence::{DivergencePoint, locate_divergence};
use crate::fingerprint::RequestSnapshot;
use crate::patterns::{PatternDetector, PatternFlags, RegexPatternDetector};

/// Provider prompt-cache lifetime.
pub const CACHE_TTL_MS: u64 = 300_000;

/// Reason recorded when there is no previous snapshot.
pub const FIRST_REQUEST_REASON: &str = "First request - no previous cache";

// ============================================================================
// Result types
// ============================================================================

/// Impact rating used for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Display colour tag.
    pub fn color(&self) -> &'static str {
        match self {
            Self::Low => "green",
            Self::Medium => "yellow",
            Self::High => "red",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Position of the divergence relative to the conversation length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Early,
    Middle,
    Late,
}

impl Location {
    /// Classify an index within `total` messages.
    pub fn classify(index: usize, total: usize) -> Self {
        let ratio = if total == 0 {
            0.0
        } else {
            index as f64 / total as f64
        };
        if ratio < 0.2 || index < 3 {
            Self::Early
        } else if ratio < 0.8 {
            Self::Middle
        } else {
            Self::Late
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Early => write!(f, "early"),
            Self::Middle => write!(f, "middle"),
            Self::Late => write!(f, "late"),
        }
    }
}

/// Likely cause derived from location and pattern cues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationCause {
    LorebookOrdering,
    DepthConfiguration,
    SystemPromptChange,
    LorebookDepthInjection,
    ContentInjection,
    ChatHistoryGrowth,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationAnalysis {
    pub location: Location,
    pub cause: LocationCause,
    pub likely_cause: String,
    pub severity: Severity,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoreIssueKind {
    Reordering,
    DifferentEntries,
}

/// Entry lists behind a lore issue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoreDetails {
    pub previous_entries: Vec<String>,
    pub current_entries: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoreIssue {
    pub kind: LoreIssueKind,
    pub severity: Severity,
    pub message: String,
    pub recommendation: String,
    pub details: LoreDetails,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryIssue {
    LorebookReordering,
    LorebookEntriesChanged,
    DepthConfiguration,
    LorebookDepthInjection,
    ChatHistoryGrowth,
    SystemPromptChange,
}

/// The single summary shown for a miss.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrimaryDiagnosis {
    pub issue: PrimaryIssue,
    pub short_message: String,
    /// Corrective action; absent when the miss is expected
    pub action: Option<String>,
    pub severity: Severity,
}

/// Everything learned about one cache miss.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiagnosisResult {
    pub reasons: Vec<String>,
    pub divergence: Option<DivergencePoint>,
    pub ttl_warning: bool,
    pub time_since_last_request_ms: Option<u64>,
    pub location_analysis: Option<LocationAnalysis>,
    pub lore_issue: Option<LoreIssue>,
    pub primary_diagnosis: Option<PrimaryDiagnosis>,
    pub system_prompt_changed: bool,
}

impl DiagnosisResult {
    /// Result for a request with nothing to compare against.
    pub fn first_request() -> Self {
        Self {
            reasons: vec![FIRST_REQUEST_REASON.to_string()],
            ..Default::default()
        }
    }

    pub fn is_first_request(&self) -> bool {
        self.reasons.len() == 1 && self.reasons[0] == FIRST_REQUEST_REASON
    }
}

// ============================================================================
// Diagnoser
// ============================================================================

/// Orchestrates the miss checks against the previous snapshot.
pub struct MissDiagnoser {
    detector: Box<dyn PatternDetector>,
    ttl_ms: u64,
}

impl fmt::Debug for MissDiagnoser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MissDiagnoser")
            .field("detector", &self.detector.name())
            .field("ttl_ms", &self.ttl_ms)
            .finish()
    }
}

impl Default for MissDiagnoser {
    fn default() -> Self {
        Self::new(Box::new(RegexPatternDetector))
    }
}

impl MissDiagnoser {
    pub fn new(detector: Box<dyn PatternDetector>) -> Self {
        Self {
            detector,
            ttl_ms: CACHE_TTL_MS,
        }
    }

    /// Override the cache lifetime used for the TTL check.
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    /// Diagnose a miss of `current` relative to `previous`.
    pub fn diagnose(
        &self,
        previous: Option<&RequestSnapshot>,
        current: &RequestSnapshot,
    ) -> DiagnosisResult {
        let Some(previous) = previous else {
            return DiagnosisResult::first_request();
        };

        let mut result = DiagnosisResult::default();

        // 1. TTL
        let elapsed_ms = (current.timestamp - previous.timestamp)
            .num_milliseconds()
            .max(0) as u64;
        result.time_since_last_request_ms = Some(elapsed_ms);
        if elapsed_ms > self.ttl_ms {
            result.ttl_warning = true;
            result.reasons.push(format!(
                "TTL expired: {:.1} minutes since last request (cache lifetime is {} minutes)",
                elapsed_ms as f64 / 60_000.0,
                self.ttl_ms / 60_000
            ));
        }

        // 2. Divergence
        let divergence = locate_divergence(&previous.fingerprints, &current.fingerprints);
        let mut lore_present = false;
        let mut depth_present = false;

        if let Some(point) = &divergence {
            result.reasons.push(point.describe());

            if let DivergencePoint::ContentChanged { index, .. } = point {
                let before = self.detect_at(previous, *index);
                let after = self.detect_at(current, *index);
                lore_present = before.has_lore() || after.has_lore();
                depth_present = before.has_depth() || after.has_depth();

                // 3. Lorebook order
                if lore_present {
                    result.lore_issue = compare_lore(&before.lore_entries, &after.lore_entries);
                    if let Some(issue) = &result.lore_issue {
                        result.reasons.push(issue.message.clone());
                    }
                }
            }

            // 4. Location
            let reordered = matches!(
                result.lore_issue,
                Some(LoreIssue {
                    kind: LoreIssueKind::Reordering,
                    ..
                })
            );
            let location = match point {
                // Every previous message is intact; only new turns were appended
                DivergencePoint::LengthChanged {
                    previous_len,
                    current_len,
                    ..
                } if current_len > previous_len => Location::Late,
                DivergencePoint::LengthChanged {
                    previous_len,
                    current_len,
                    ..
                } => Location::classify(*current_len, *previous_len),
                DivergencePoint::ContentChanged { index, .. } => {
                    Location::classify(*index, current.len())
                }
            };
            let analysis = explain_location(location, reordered, lore_present, depth_present);
            result.reasons.push(analysis.likely_cause.clone());
            result.location_analysis = Some(analysis);
        } else if !result.ttl_warning {
            result.reasons.push(
                "No message changes detected; the cached prefix may have been evicted early"
                    .to_string(),
            );
        }

        // 5. Primary diagnosis
        result.primary_diagnosis =
            select_primary(result.lore_issue.as_ref(), result.location_analysis.as_ref());

        // 6. System prompt
        if system_prompt_changed(previous, current) {
            result.system_prompt_changed = true;
            result
                .reasons
                .push("System prompt changed since the previous request".to_string());
        }

        debug!(
            reasons = result.reasons.len(),
            ttl_warning = result.ttl_warning,
            divergence = ?divergence.as_ref().map(DivergencePoint::index),
            primary = ?result.primary_diagnosis.as_ref().map(|p| p.issue),
            "diagnosis complete"
        );

        result.divergence = divergence;
        result
    }

    fn detect_at(&self, snapshot: &RequestSnapshot, index: usize) -> PatternFlags {
        snapshot
            .fingerprints
            .get(index)
            .map(|fp| self.detector.detect(&fp.full_content))
            .unwrap_or_default()
    }
}

// ============================================================================
// Analysis steps
// ============================================================================

/// Compare lorebook entry lists from the divergent message.
pub fn compare_lore(previous: &[String], current: &[String]) -> Option<LoreIssue> {
    if previous == current {
        return None;
    }

    let (added, removed) = multiset_difference(previous, current);
    let details = LoreDetails {
        previous_entries: previous.to_vec(),
        current_entries: current.to_vec(),
        added,
        removed,
    };

    if details.added.is_empty() && details.removed.is_empty() {
        return Some(LoreIssue {
            kind: LoreIssueKind::Reordering,
            severity: Severity::High,
            message: format!(
                "Lorebook entries reordered ({} entries, same set)",
                previous.len()
            ),
            recommendation: "Give lorebook entries fixed insertion orders so activation does not shuffle them".to_string(),
            details,
        });
    }

    let mut parts = Vec::new();
    if !details.added.is_empty() {
        parts.push(format!("added: {}", details.added.join(", ")));
    }
    if !details.removed.is_empty() {
        parts.push(format!("removed: {}", details.removed.join(", ")));
    }

    Some(LoreIssue {
        kind: LoreIssueKind::DifferentEntries,
        severity: Severity::Medium,
        message: format!("Different lorebook entries activated ({})", parts.join("; ")),
        recommendation: "Move keyword-triggered entries below the cached prefix or make them constant".to_string(),
        details,
    })
}

/// Entries only in `current` (added) and only in `previous` (removed),
/// counting duplicates.
fn multiset_difference(previous: &[String], current: &[String]) -> (Vec<String>, Vec<String>) {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for name in previous {
        *counts.entry(name.as_str()).or_default() -= 1;
    }
    for name in current {
        *counts.entry(name.as_str()).or_default() += 1;
    }

    let mut added = Vec::new();
    for name in current {
        if let Some(c) = counts.get_mut(name.as_str()).filter(|c| **c > 0) {
            *c -= 1;
            added.push(name.clone());
        }
    }
    let mut removed = Vec::new();
    for name in previous {
        if let Some(c) = counts.get_mut(name.as_str()).filter(|c| **c < 0) {
            *c += 1;
            removed.push(name.clone());
        }
    }
    (added, removed)
}

/// Attach the likely cause and recommendation to a classified location.
fn explain_location(
    location: Location,
    lore_reordered: bool,
    lore_present: bool,
    depth_present: bool,
) -> LocationAnalysis {
    let (cause, severity, likely_cause, recommendation) = match location {
        Location::Early if lore_reordered => (
            LocationCause::LorebookOrdering,
            Severity::High,
            "Lorebook entries near the top of the prompt changed order",
            "Pin lorebook insertion order or move lore below the cache breakpoint",
        ),
        Location::Early if depth_present => (
            LocationCause::DepthConfiguration,
            Severity::High,
            "Depth-injected content landed near the start of the prompt",
            "Increase injection depth values so they sit after the cached prefix",
        ),
        Location::Early => (
            LocationCause::SystemPromptChange,
            Severity::Medium,
            "Change near the start of the prompt, likely the system prompt or character card",
            "Keep the system prompt and character card stable between requests",
        ),
        Location::Middle if lore_present => (
            LocationCause::LorebookDepthInjection,
            Severity::High,
            "Lorebook content injected at depth inside the chat history",
            "Insert lorebook entries before or after the chat history instead of at depth",
        ),
        Location::Middle => (
            LocationCause::ContentInjection,
            Severity::Medium,
            "Content injected into the middle of the conversation",
            "Look for author's notes or extensions inserting text at a fixed depth",
        ),
        Location::Late => (
            LocationCause::ChatHistoryGrowth,
            Severity::Low,
            "Chat history growth at the end of the conversation (expected)",
            "No action needed; the prefix before the new turn should cache next time",
        ),
    };

    LocationAnalysis {
        location,
        cause,
        likely_cause: likely_cause.to_string(),
        severity,
        recommendation: recommendation.to_string(),
    }
}

/// Pick the primary diagnosis by fixed precedence.
pub fn select_primary(
    lore: Option<&LoreIssue>,
    location: Option<&LocationAnalysis>,
) -> Option<PrimaryDiagnosis> {
    if let Some(issue) = lore {
        let primary = match issue.kind {
            LoreIssueKind::Reordering => PrimaryDiagnosis {
                issue: PrimaryIssue::LorebookReordering,
                short_message: "Lorebook entries are being reordered".to_string(),
                action: Some(issue.recommendation.clone()),
                severity: Severity::High,
            },
            LoreIssueKind::DifferentEntries => PrimaryDiagnosis {
                issue: PrimaryIssue::LorebookEntriesChanged,
                short_message: "Different lorebook entries were activated".to_string(),
                action: Some(issue.recommendation.clone()),
                severity: Severity::Medium,
            },
        };
        return Some(primary);
    }

    let location = location?;
    let primary = match location.cause {
        LocationCause::DepthConfiguration => PrimaryDiagnosis {
            issue: PrimaryIssue::DepthConfiguration,
            short_message: "Depth injection is breaking the cached prefix".to_string(),
            action: Some(location.recommendation.clone()),
            severity: Severity::High,
        },
        LocationCause::LorebookDepthInjection => PrimaryDiagnosis {
            issue: PrimaryIssue::LorebookDepthInjection,
            short_message: "Lorebook entries injected at depth".to_string(),
            action: Some(location.recommendation.clone()),
            severity: Severity::High,
        },
        LocationCause::ChatHistoryGrowth => PrimaryDiagnosis {
            issue: PrimaryIssue::ChatHistoryGrowth,
            short_message: "Normal chat history growth".to_string(),
            action: None,
            severity: Severity::Low,
        },
        LocationCause::SystemPromptChange => PrimaryDiagnosis {
            issue: PrimaryIssue::SystemPromptChange,
            short_message: "System prompt or character card changed".to_string(),
            action: Some(location.recommendation.clone()),
            severity: Severity::Medium,
        },
        LocationCause::LorebookOrdering | LocationCause::ContentInjection => return None,
    };
    Some(primary)
}

fn system_prompt_changed(previous: &RequestSnapshot, current: &RequestSnapshot) -> bool {
    match (previous.leading_system(), current.leading_system()) {
        (Some(p), Some(c)) => !p.same_content(c),
        _ => match (&previous.system_prompt_hash, &current.system_prompt_hash) {
            (Some(p), Some(c)) => p != c,
            _ => false,
        },
    }
}
