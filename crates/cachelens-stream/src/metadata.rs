//! Remote generation-metadata lookup.
//!
//! Some routing gateways strip cache counters from the streamed usage. The
//! gateway's generation endpoint still reports them after the fact, so when a
//! Claude response arrives with both counters at zero the interceptor asks
//! here before settling on "no cache activity".

use std::time::Duration;

use cachelens_core::MetadataConfig;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Result, StreamError};

/// Cache counters recovered from the metadata endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl CacheCounters {
    /// True if the endpoint reported any cache activity.
    pub fn has_activity(&self) -> bool {
        self.cache_read_input_tokens > 0 || self.cache_creation_input_tokens > 0
    }
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    data: Option<GenerationData>,
}

#[derive(Debug, Deserialize)]
struct GenerationData {
    #[serde(default)]
    native_tokens_cached: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

/// Client for `GET {base_url}/generation?id=<id>`.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl MetadataClient {
    /// Create a client. A `None` key makes every lookup return `None`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    /// Create a client from the metadata section of the config file.
    pub fn from_config(config: &MetadataConfig) -> Result<Self> {
        Self::new(
            config.base_url.clone(),
            config.resolve_api_key(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Whether a credential is available.
    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Look up cache counters for a generation.
    ///
    /// Every failure is logged and collapses to `None`.
    pub async fn fetch_cache_counters(&self, generation_id: &str) -> Option<CacheCounters> {
        match self.try_fetch(generation_id).await {
            Ok(counters) => {
                debug!(
                    generation_id,
                    cache_read = counters.cache_read_input_tokens,
                    cache_write = counters.cache_creation_input_tokens,
                    "recovered cache counters from metadata"
                );
                Some(counters)
            }
            Err(StreamError::MissingCredential) => {
                debug!(generation_id, "metadata lookup skipped: no credential");
                None
            }
            Err(e) => {
                warn!(generation_id, error = %e, "metadata lookup failed");
                None
            }
        }
    }

    async fn try_fetch(&self, generation_id: &str) -> Result<CacheCounters> {
        let api_key = self.api_key.as_deref().ok_or(StreamError::MissingCredential)?;

        let response = self
            .client
            .get(format!("{}/generation", self.base_url))
            .query(&[("id", generation_id)])
            .bearer_auth(api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::MetadataStatus { status, body });
        }

        let text = response.text().await?;
        let parsed: GenerationResponse = serde_json::from_str(&text)
            .map_err(|e| StreamError::MalformedMetadata(e.to_string()))?;
        let data = parsed
            .data
            .ok_or_else(|| StreamError::MalformedMetadata("missing data object".into()))?;

        Ok(CacheCounters {
            cache_read_input_tokens: data
                .native_tokens_cached
                .or(data.cache_read_input_tokens)
                .unwrap_or(0),
            cache_creation_input_tokens: data.cache_creation_input_tokens.unwrap_or(0),
        })
    }
}
