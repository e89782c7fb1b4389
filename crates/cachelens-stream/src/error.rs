//! Error types for stream tapping and metadata lookup.

use thiserror::Error;

/// Stream and metadata errors.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The underlying transport failed mid-stream
    #[error("Stream transport failed: {0}")]
    Transport(String),

    /// The stream was cancelled before completion
    #[error("Stream cancelled: {0}")]
    Cancelled(String),

    /// The request executor could not start the request
    #[error("Request execution failed: {0}")]
    Execution(String),

    /// Metadata API returned a non-success status
    #[error("Metadata API error: {status} - {body}")]
    MetadataStatus { status: u16, body: String },

    /// Metadata lookup attempted without a credential
    #[error("No metadata credential configured")]
    MissingCredential,

    /// Metadata response did not have the expected shape
    #[error("Malformed metadata response: {0}")]
    MalformedMetadata(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl StreamError {
    /// Returns true if the stream ended because it was cancelled.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StreamError::Cancelled(_))
    }

    /// Check if this error is a network-related error.
    pub fn is_network_error(&self) -> bool {
        match self {
            StreamError::Transport(_) => true,
            StreamError::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            StreamError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Get a user-friendly error message.
    pub fn friendly_message(&self) -> String {
        match self {
            StreamError::Transport(msg) => {
                format!("Response stream broke off: {}. The request was not retried.", msg)
            }
            StreamError::Cancelled(_) => "Response stream was cancelled.".to_string(),
            StreamError::MissingCredential => {
                "Generation metadata lookup skipped: no API key configured.".to_string()
            }
            StreamError::MetadataStatus { status, .. } => {
                format!("Generation metadata lookup failed with HTTP {}.", status)
            }
            _ => format!("Error: {}", self),
        }
    }
}

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;
