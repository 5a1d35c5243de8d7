//! Error types for the conversation evaluator
//!
//! This module provides structured error handling using thiserror.
//! The variants map onto the failure classes the pipeline distinguishes:
//! transient network failures, persistence failures, malformed provider
//! payloads and evaluator failures.

use thiserror::Error;

/// Main error type for convai-evaluator operations
#[derive(Error, Debug)]
pub enum ConvaiError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Schema creation failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Transport-level failure talking to a remote service
    #[error("Network error: {0}")]
    Network(String),

    /// Remote service answered with a non-success status
    #[error("Remote API error ({status}): {message}")]
    RemoteApi { status: u16, message: String },

    /// Provider returned a payload we could not decode
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Evaluator failed to produce a usable result
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Conversation not found
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration values are well-formed but unusable
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for convai-evaluator operations
pub type Result<T> = std::result::Result<T, ConvaiError>;

impl ConvaiError {
    /// Whether the failure is expected to clear up on a later cycle
    pub fn is_transient(&self) -> bool {
        match self {
            ConvaiError::Network(_) => true,
            ConvaiError::RemoteApi { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<libsql::Error> for ConvaiError {
    fn from(err: libsql::Error) -> Self {
        ConvaiError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for ConvaiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ConvaiError::MalformedPayload(err.to_string())
        } else if let Some(status) = err.status() {
            ConvaiError::RemoteApi {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ConvaiError::Network(err.to_string())
        }
    }
}
