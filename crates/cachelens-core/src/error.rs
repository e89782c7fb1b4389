//! Error types for cachelens operations.
//!
//! This module defines [`CacheLensError`], the error enum shared by the
//! configuration, logging and request-parsing layers. Nothing in the
//! diagnostic pipeline raises these into the host's request path; they are
//! returned from setup calls (config loading, logging init) only.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`CacheLensError`].
pub type Result<T> = std::result::Result<T, CacheLensError>;

/// Error type for cachelens setup and parsing operations.
#[derive(Debug, Error)]
pub enum CacheLensError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Parsing Errors
    // =========================================================================
    /// JSON parsing error
    #[error("JSON parse error in {context}: {message}")]
    JsonParse {
        context: String,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// Request body is missing a usable message list
    #[error("Request has no messages: {url}")]
    RequestWithoutMessages { url: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in cachelens)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CacheLensError {
    /// Create a ConfigNotFound error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a ConfigValidation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a JSON parse error
    pub fn json_parse(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::JsonParse {
            context: context.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. } | Self::ConfigInvalid { .. } | Self::ConfigValidation { .. }
        )
    }

    /// Returns actionable guidance for the user
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => {
                Some("Create ~/.cachelens/config.yaml or pass --config with an explicit path")
            }
            Self::ConfigInvalid { .. } => Some("Check YAML syntax in the configuration file"),
            Self::ConfigValidation { .. } => {
                Some("waste_detection.threshold and history_capacity must be positive")
            }
            Self::RequestWithoutMessages { .. } => {
                Some("Captured request bodies need a `messages` or `prompt.messages` array")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_not_found_error() {
        let err = CacheLensError::config_not_found("/home/user/.cachelens/config.yaml");
        assert!(err.to_string().contains("Configuration not found"));
        assert!(err.is_config_error());
        assert!(err.guidance().is_some());
    }

    #[test]
    fn test_json_parse_error_keeps_message() {
        let source = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = CacheLensError::json_parse("request body", source);
        assert!(err.to_string().contains("request body"));
        assert!(!err.is_config_error());
    }

    #[test]
    fn test_internal_has_no_guidance() {
        let err = CacheLensError::internal("bug");
        assert_eq!(err.guidance(), None);
    }
}
