//! Usage extraction from decoded response payloads.
//!
//! Three payload shapes are recognized and normalized to a [`UsageRecord`]:
//! - native `message_delta` events carrying incremental `usage`
//! - native `message_start` events carrying `message.usage` and `message.model`
//! - OpenAI-style envelopes with a top-level `usage` object
//!   (`prompt_tokens`/`completion_tokens`, optional nested cached counts)
//!
//! Shapes are tried in that order; the first match wins. Foreign model
//! families are parsed like any other payload; filtering happens downstream.

use cachelens_core::UsageRecord;
use serde_json::Value;
use tracing::trace;

/// Which payload shape produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageShape {
    /// `message_delta` event
    Delta,
    /// `message_start` event
    Start,
    /// Generic object with a top-level `usage`
    Envelope,
}

/// Result of extracting usage from one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedUsage {
    pub record: UsageRecord,
    pub shape: UsageShape,
    /// Provider generation/message id, when the payload carries one
    pub generation_id: Option<String>,
}

/// Extract usage from one decoded JSON payload.
///
/// Returns `None` when the payload carries no recognized usage shape.
pub fn extract_usage(payload: &Value) -> Option<ExtractedUsage> {
    extract_delta(payload)
        .or_else(|| extract_start(payload))
        .or_else(|| extract_envelope(payload))
}

/// Extract usage from a whole (non-streamed) JSON response body.
pub fn extract_from_body(body: &[u8]) -> Option<ExtractedUsage> {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => extract_usage(&value),
        Err(e) => {
            trace!(error = %e, "response body is not JSON");
            None
        }
    }
}

/// Extract usage from one raw `data:` payload string.
///
/// Parse failures are expected for partial frames and yield `None`.
pub fn extract_from_payload(payload: &str) -> Option<ExtractedUsage> {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => extract_usage(&value),
        Err(e) => {
            trace!(error = %e, len = payload.len(), "skipping non-JSON payload");
            None
        }
    }
}

fn event_type(payload: &Value) -> Option<&str> {
    payload.get("type").and_then(|t| t.as_str())
}

fn usage_object(value: &Value) -> Option<&Value> {
    value.get("usage").filter(|u| u.is_object())
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Read a token count, treating absent, null, negative and non-numeric as 0.
fn count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Read the first present count among several keys.
fn first_count(usage: &Value, keys: &[&str]) -> u64 {
    keys.iter()
        .find_map(|k| usage.get(*k).filter(|v| v.is_number()))
        .map(|v| count(Some(v)))
        .unwrap_or(0)
}

fn native_record(model: String, usage: &Value) -> UsageRecord {
    UsageRecord {
        model,
        input_tokens: count(usage.get("input_tokens")),
        output_tokens: count(usage.get("output_tokens")),
        cache_read_input_tokens: count(usage.get("cache_read_input_tokens")),
        cache_creation_input_tokens: count(usage.get("cache_creation_input_tokens")),
    }
}

fn extract_delta(payload: &Value) -> Option<ExtractedUsage> {
    if event_type(payload)? != "message_delta" {
        return None;
    }
    let usage = usage_object(payload)?;
    let model = string_field(payload, "model").unwrap_or_default();

    Some(ExtractedUsage {
        record: native_record(model, usage),
        shape: UsageShape::Delta,
        generation_id: None,
    })
}

fn extract_start(payload: &Value) -> Option<ExtractedUsage> {
    if event_type(payload)? != "message_start" {
        return None;
    }
    let message = payload.get("message")?;
    let usage = usage_object(message)?;
    let model = string_field(message, "model").unwrap_or_default();

    Some(ExtractedUsage {
        record: native_record(model, usage),
        shape: UsageShape::Start,
        generation_id: string_field(message, "id"),
    })
}

fn extract_envelope(payload: &Value) -> Option<ExtractedUsage> {
    let usage = usage_object(payload)?;
    let details = usage.get("prompt_tokens_details");

    let cache_read = match usage.get("cache_read_input_tokens") {
        Some(v) if v.is_number() => count(Some(v)),
        _ => details.map(|d| count(d.get("cached_tokens"))).unwrap_or(0),
    };
    let cache_creation = match usage.get("cache_creation_input_tokens") {
        Some(v) if v.is_number() => count(Some(v)),
        _ => details
            .map(|d| first_count(d, &["cache_write_tokens", "cache_creation_tokens"]))
            .unwrap_or(0),
    };

    let record = UsageRecord {
        model: string_field(payload, "model").unwrap_or_default(),
        input_tokens: first_count(usage, &["prompt_tokens", "input_tokens"]),
        output_tokens: first_count(usage, &["completion_tokens", "output_tokens"]),
        cache_read_input_tokens: cache_read,
        cache_creation_input_tokens: cache_creation,
    };

    Some(ExtractedUsage {
        record,
        shape: UsageShape::Envelope,
        generation_id: string_field(payload, "id"),
    })
}

/// Merges successive extractions from a single response.
///
/// A non-empty model replaces the current one; every counter is replaced by
/// any later non-zero value, since delta events carry cumulative counts.
#[derive(Debug, Default, Clone)]
pub struct UsageAccumulator {
    record: UsageRecord,
    generation_id: Option<String>,
    events: usize,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one extraction into the running record.
    pub fn absorb(&mut self, extracted: ExtractedUsage) {
        let ExtractedUsage {
            record,
            shape,
            generation_id,
        } = extracted;

        if !record.model.is_empty() {
            self.record.model = record.model;
        }
        replace_if_nonzero(&mut self.record.input_tokens, record.input_tokens);
        replace_if_nonzero(&mut self.record.output_tokens, record.output_tokens);
        replace_if_nonzero(
            &mut self.record.cache_read_input_tokens,
            record.cache_read_input_tokens,
        );
        replace_if_nonzero(
            &mut self.record.cache_creation_input_tokens,
            record.cache_creation_input_tokens,
        );
        if self.generation_id.is_none() {
            self.generation_id = generation_id;
        }
        self.events += 1;

        trace!(?shape, events = self.events, "absorbed usage event");
    }

    /// Parse one payload and merge it if it carries usage.
    ///
    /// Returns true if usage was found.
    pub fn feed_payload(&mut self, payload: &str) -> bool {
        match extract_from_payload(payload) {
            Some(extracted) => {
                self.absorb(extracted);
                true
            }
            None => false,
        }
    }

    /// Returns true if at least one usage event was absorbed.
    pub fn has_data(&self) -> bool {
        self.events > 0
    }

    /// Finish accumulation, returning the record and generation id.
    pub fn finish(self) -> Option<(UsageRecord, Option<String>)> {
        self.has_data().then_some((self.record, self.generation_id))
    }
}

fn replace_if_nonzero(slot: &mut u64, value: u64) {
    if value > 0 {
        *slot = value;
    }
}
