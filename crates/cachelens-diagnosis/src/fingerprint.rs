//! Message fingerprints and request snapshots.
//!
//! A fingerprint is a 64-bit hash of a message's canonical form (role plus
//! content JSON) together with a short preview. Two fingerprints with equal
//! hashes are treated as the same message; collisions only cost a missed
//! divergence, never a wrong answer about billing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use cachelens_core::{Message, RequestDescriptor, Role};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Maximum preview length in characters, ellipsis included.
pub const PREVIEW_CHARS: usize = 100;

/// Deterministic fingerprint of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageFingerprint {
    pub index: usize,
    pub role: Role,
    pub content_hash: String,
    pub content_preview: String,
    #[serde(skip)]
    pub full_content: String,
    pub has_cache_control: bool,
}

impl MessageFingerprint {
    /// Fingerprint the message at `index`.
    pub fn of(index: usize, message: &Message) -> Self {
        let full_content = message.text();
        Self {
            index,
            role: message.role.clone(),
            content_hash: content_hash(&message.canonical()),
            content_preview: preview(&full_content, PREVIEW_CHARS),
            full_content,
            has_cache_control: message.cache_control,
        }
    }

    /// Whether two fingerprints describe the same message content.
    pub fn same_content(&self, other: &MessageFingerprint) -> bool {
        self.content_hash == other.content_hash
    }
}

/// Fingerprint every message in order.
pub fn fingerprint_messages(messages: &[Message]) -> Vec<MessageFingerprint> {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| MessageFingerprint::of(i, m))
        .collect()
}

/// Hash a string to 16 lowercase hex characters.
///
/// `DefaultHasher::new()` uses fixed keys, so the value is stable for the
/// lifetime of the process.
pub fn content_hash(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Single-line preview of at most `max_chars` characters.
pub fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Everything the diagnoser needs to remember about one request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    #[serde(skip)]
    pub messages: Vec<Message>,
    pub fingerprints: Vec<MessageFingerprint>,
    pub system_prompt_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RequestSnapshot {
    /// Capture a snapshot from an outbound request at dispatch time.
    pub fn capture(request: &RequestDescriptor, timestamp: DateTime<Utc>) -> Self {
        let system = request.system_prompt();
        Self::from_messages(request.messages(), system.as_deref(), timestamp)
    }

    /// Build a snapshot from an already-parsed message list.
    pub fn from_messages(
        messages: Vec<Message>,
        system_prompt: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let fingerprints = fingerprint_messages(&messages);
        Self {
            messages,
            fingerprints,
            system_prompt_hash: system_prompt.map(content_hash),
            timestamp,
        }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// First fingerprint, if it is a system message.
    pub fn leading_system(&self) -> Option<&MessageFingerprint> {
        self.fingerprints.first().filter(|f| f.role == Role::System)
    }
}
