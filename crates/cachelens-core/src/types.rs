//! Shared type definitions used across cachelens crates.
//!
//! The usage record and message model here are what the extractor produces,
//! the fingerprint engine hashes, and the session aggregator accumulates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CacheLensError, Result};

/// Normalized token usage for one completed request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Model identifier (e.g., "claude-sonnet-4-5-20250929"); empty when unknown
    pub model: String,
    /// Input tokens as reported by the provider
    pub input_tokens: u64,
    /// Output tokens
    pub output_tokens: u64,
    /// Input tokens served from the prompt cache
    pub cache_read_input_tokens: u64,
    /// Input tokens written into the prompt cache
    pub cache_creation_input_tokens: u64,
}

impl UsageRecord {
    /// Create a record with the given model and zero counters.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set input/output tokens.
    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    /// Set cache read/creation tokens.
    pub fn with_cache(mut self, read: u64, creation: u64) -> Self {
        self.cache_read_input_tokens = read;
        self.cache_creation_input_tokens = creation;
        self
    }

    /// Returns true if the model belongs to the Claude family.
    pub fn is_claude(&self) -> bool {
        self.model.to_lowercase().contains("claude")
    }

    /// Classify the cache outcome of this record.
    pub fn outcome(&self) -> CacheOutcome {
        if self.cache_read_input_tokens > 0 {
            CacheOutcome::Hit
        } else if self.cache_creation_input_tokens > 0 {
            CacheOutcome::WriteMiss
        } else {
            CacheOutcome::NoCacheActivity
        }
    }

    /// Returns true if any cache counter is non-zero.
    pub fn has_cache_counters(&self) -> bool {
        self.cache_read_input_tokens > 0 || self.cache_creation_input_tokens > 0
    }

    /// Input tokens as reported, or the cache total when the report is smaller.
    ///
    /// Streaming responses have been observed to report `input_tokens` that
    /// exclude cached tokens; this reconciliation is provisional.
    pub fn reconciled_input(&self) -> u64 {
        self.input_tokens
            .max(self.cache_read_input_tokens + self.cache_creation_input_tokens)
    }

    /// The counters handed to the host persistence callback.
    pub fn persisted(&self) -> PersistedUsage {
        PersistedUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens,
        }
    }
}

/// Cache outcome of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Some input was served from the cache
    Hit,
    /// Nothing was read but the prompt was written to the cache
    WriteMiss,
    /// Neither reads nor writes were reported
    NoCacheActivity,
}

impl CacheOutcome {
    /// Returns the status indicator for display.
    pub fn indicator(&self) -> &'static str {
        match self {
            Self::Hit => "✓",
            Self::WriteMiss => "✗",
            Self::NoCacheActivity => "·",
        }
    }
}

impl std::fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hit => write!(f, "hit"),
            Self::WriteMiss => write!(f, "miss"),
            Self::NoCacheActivity => write!(f, "no cache activity"),
        }
    }
}

/// Counters attached to the host's most recent non-user message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

/// Message author role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Other(String),
}

impl Role {
    /// Parse a role name, case-insensitively.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "system" | "developer" => Self::System,
            "user" | "human" => Self::User,
            "assistant" | "model" => Self::Assistant,
            "tool" | "function" => Self::Tool,
            _ => Self::Other(name.to_string()),
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message of an outbound chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author role
    pub role: Role,
    /// Raw content: a string or an array of content blocks
    pub content: Value,
    /// Whether the message or any of its blocks carries `cache_control`
    #[serde(default)]
    pub cache_control: bool,
}

impl Message {
    /// Create a message with plain string content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Value::String(content.into()),
            cache_control: false,
        }
    }

    /// Mark the message as a cache boundary.
    pub fn with_cache_control(mut self) -> Self {
        self.cache_control = true;
        self
    }

    /// Build a message from one element of a request's `messages` array.
    ///
    /// Returns `None` when the element is not an object with a `role`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let role = Role::parse(obj.get("role")?.as_str()?);
        let content = obj.get("content").cloned().unwrap_or(Value::Null);

        let block_marker = content
            .as_array()
            .is_some_and(|blocks| blocks.iter().any(|b| b.get("cache_control").is_some()));
        let cache_control = obj.contains_key("cache_control") || block_marker;

        Some(Self {
            role,
            content,
            cache_control,
        })
    }

    /// Flattened text of the message.
    ///
    /// String content is returned as is; block arrays contribute the `text`
    /// of each block joined by newlines. Content with no text falls back to
    /// its JSON rendering.
    pub fn text(&self) -> String {
        match &self.content {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Array(blocks) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect();
                if parts.is_empty() {
                    self.content.to_string()
                } else {
                    parts.join("\n")
                }
            }
            other => other.to_string(),
        }
    }

    /// Canonical serialized form used for hashing (role + content JSON).
    pub fn canonical(&self) -> String {
        format!("{}\u{1f}{}", self.role.as_str(), self.content)
    }
}

/// Outbound request observed from the host.
///
/// The descriptor is read-only: nothing in cachelens mutates the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Target URL of the request
    pub url: String,
    /// JSON request body
    pub body: Value,
}

impl RequestDescriptor {
    /// Create a descriptor from a URL and a parsed body.
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            body,
        }
    }

    /// Parse a descriptor from a raw JSON body.
    pub fn from_json(url: impl Into<String>, body: &str) -> Result<Self> {
        let body = serde_json::from_str(body)
            .map_err(|e| CacheLensError::json_parse("request body", e))?;
        Ok(Self::new(url, body))
    }

    /// Messages of the request, read from `messages` or `prompt.messages`.
    pub fn messages(&self) -> Vec<Message> {
        let list = self
            .body
            .get("messages")
            .and_then(|m| m.as_array())
            .or_else(|| {
                self.body
                    .get("prompt")
                    .and_then(|p| p.get("messages"))
                    .and_then(|m| m.as_array())
            });

        list.map(|items| items.iter().filter_map(Message::from_value).collect())
            .unwrap_or_default()
    }

    /// Returns true if the body carries a message list.
    pub fn has_messages(&self) -> bool {
        self.body.get("messages").is_some_and(|m| m.is_array())
            || self
                .body
                .get("prompt")
                .and_then(|p| p.get("messages"))
                .is_some_and(|m| m.is_array())
    }

    /// Top-level `system` prompt (string or text blocks), if present.
    pub fn system_prompt(&self) -> Option<String> {
        match self.body.get("system")? {
            Value::String(s) => Some(s.clone()),
            Value::Array(blocks) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect();
                (!parts.is_empty()).then(|| parts.join("\n"))
            }
            _ => None,
        }
    }

    /// Whether the request asked for a streamed response.
    pub fn is_stream(&self) -> bool {
        self.body
            .get("stream")
            .and_then(|s| s.as_bool())
            .unwrap_or(false)
    }

    /// Model named in the request body.
    pub fn model(&self) -> Option<&str> {
        self.body.get("model").and_then(|m| m.as_str())
    }
}
