//! Error types for the cost model.

use thiserror::Error;

/// Cost model errors.
#[derive(Error, Debug)]
pub enum CostError {
    /// A price tier has an empty pattern or an unusable price
    #[error("invalid price tier '{pattern}': {message}")]
    InvalidTier {
        /// Pattern of the offending tier
        pattern: String,
        /// Human-readable message
        message: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl CostError {
    /// Create a user-friendly message for this error.
    pub fn friendly_message(&self) -> String {
        match self {
            CostError::InvalidTier { pattern, message } => {
                format!("Price tier '{}' is unusable: {}. Check the pricing section of your config.", pattern, message)
            }
            CostError::Config(msg) => format!("Configuration error: {}", msg),
        }
    }
}

/// Result type for cost operations.
pub type Result<T> = std::result::Result<T, CostError>;
