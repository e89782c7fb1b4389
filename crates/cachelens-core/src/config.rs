//! Configuration for cachelens.
//!
//! Configuration lives in `~/.cachelens/config.yaml`. Every field has a
//! default, so a missing or empty file yields a working setup:
//!
//! ```yaml
//! waste_detection:
//!   enabled: true
//!   threshold: 3
//! metadata:
//!   api_key_env: OPENROUTER_API_KEY
//!   base_url: https://openrouter.ai/api/v1
//!   timeout_secs: 10
//! history_capacity: 100
//! pricing:
//!   tiers:
//!     - pattern: claude-sonnet-4-5
//!       input: 3.0
//!       output: 15.0
//!       cache_write: 3.75
//!       cache_read: 0.30
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CacheLensError, Result};
use crate::logging::cachelens_home;

/// Default consecutive-miss count that triggers a waste warning.
pub const DEFAULT_WASTE_THRESHOLD: u32 = 3;

/// Default number of history entries kept in memory.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Top-level cachelens configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheLensConfig {
    /// Consecutive-miss waste warning
    #[serde(default)]
    pub waste_detection: WasteDetectionConfig,

    /// Remote generation-metadata lookup
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Capacity of the request history ring buffer
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Additional price tiers
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl Default for CacheLensConfig {
    fn default() -> Self {
        Self {
            waste_detection: WasteDetectionConfig::default(),
            metadata: MetadataConfig::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            pricing: PricingConfig::default(),
        }
    }
}

/// Waste warning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WasteDetectionConfig {
    /// Whether the warning is emitted at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive cache misses that trigger the warning
    #[serde(default = "default_threshold")]
    pub threshold: u32,
}

impl Default for WasteDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_WASTE_THRESHOLD,
        }
    }
}

/// Generation-metadata lookup settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Bearer credential; takes precedence over `api_key_env`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the credential
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the metadata API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Resolve the credential from the config value or the environment.
    ///
    /// Empty strings count as absent.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

/// User-supplied price tiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Tiers checked before the built-in table, in order
    #[serde(default)]
    pub tiers: Vec<TierOverride>,
}

/// One price tier in USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierOverride {
    /// Case-insensitive substring matched against the model identifier
    pub pattern: String,
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> u32 {
    DEFAULT_WASTE_THRESHOLD
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

/// Default config file path (`~/.cachelens/config.yaml`).
pub fn default_config_path() -> Result<PathBuf> {
    Ok(cachelens_home()?.join("config.yaml"))
}

impl CacheLensConfig {
    /// Load from the default path, falling back to defaults when absent.
    pub fn load_default() -> Result<Self> {
        let path = default_config_path()?;
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load and validate configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CacheLensError::config_not_found(path));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| CacheLensError::io("reading config", path, e))?;

        let config = Self::parse(&content).map_err(|e| match e {
            CacheLensError::ConfigInvalid { message, .. } => CacheLensError::ConfigInvalid {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;

        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self =
            serde_yaml::from_str(content).map_err(|e| CacheLensError::ConfigInvalid {
                path: PathBuf::new(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.waste_detection.threshold == 0 {
            return Err(CacheLensError::config_validation(
                "waste_detection.threshold must be >= 1",
            ));
        }

        if self.history_capacity == 0 {
            return Err(CacheLensError::config_validation(
                "history_capacity must be >= 1",
            ));
        }

        for tier in &self.pricing.tiers {
            if tier.pattern.trim().is_empty() {
                return Err(CacheLensError::config_validation(
                    "pricing tier pattern must not be empty",
                ));
            }
            let prices = [tier.input, tier.output, tier.cache_write, tier.cache_read];
            if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(CacheLensError::config_validation(format!(
                    "pricing tier '{}' has a negative or non-finite price",
                    tier.pattern
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = CacheLensConfig::default();
        assert!(config.waste_detection.enabled);
        assert_eq!(config.waste_detection.threshold, 3);
        assert_eq!(config.history_capacity, 100);
        assert!(config.validate().is_ok());
        assert!(config.pricing.tiers.is_empty());
    }

    #[test]
    fn test_parse_empty_yields_defaults() {
        let config = CacheLensConfig::parse("").unwrap();
        assert_eq!(config.waste_detection.threshold, 3);
    }

    #[test]
    fn test_parse_partial_yaml_fills_defaults() {
        let config = CacheLensConfig::parse("waste_detection:\n  threshold: 5\n").unwrap();
        assert_eq!(config.waste_detection.threshold, 5);
        assert!(config.waste_detection.enabled);
        assert_eq!(config.history_capacity, DEFAULT_HISTORY_CAPACITY);
        assert_eq!(config.metadata.timeout_secs, 10);
    }

    #[test]
    fn test_parse_rejects_zero_threshold() {
        let err = CacheLensConfig::parse("waste_detection:\n  threshold: 0\n").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_parse_rejects_negative_price() {
        let yaml = r#"
pricing:
  tiers:
    - pattern: claude-test
      input: -1.0
      output: 1.0
      cache_write: 1.0
      cache_read: 0.1
"#;
        let err = CacheLensConfig::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("claude-test"));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = CacheLensConfig::parse("waste_detection: [unclosed").unwrap_err();
        assert!(matches!(err, CacheLensError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "metadata:\n  api_key: sk-or-test\nhistory_capacity: 20").unwrap();
        file.flush().unwrap();

        let config = CacheLensConfig::load_from(file.path()).unwrap();
        assert_eq!(config.history_capacity, 20);
        assert_eq!(config.metadata.resolve_api_key().as_deref(), Some("sk-or-test"));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = CacheLensConfig::load_from(Path::new("/nonexistent/cachelens.yaml")).unwrap_err();
        assert!(matches!(err, CacheLensError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_blank_api_key_is_absent() {
        let config = MetadataConfig {
            api_key: Some("   ".into()),
            api_key_env: "CACHELENS_TEST_UNSET_KEY".into(),
            ..Default::default()
        };
        assert_eq!(config.resolve_api_key(), None);
    }
}
