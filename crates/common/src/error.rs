//! Common error types for AnyInfer
//!
//! This module defines all error types used across the AnyInfer system.
//! Transport failures are kept apart from timeouts so callers can tell
//! "no answer yet" from "broker unreachable".

use thiserror::Error;

/// Main error type for AnyInfer
#[derive(Error, Debug)]
pub enum AnyInferError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker transport errors (connection or protocol hiccups)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Queue or exchange does not exist on the broker
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message that does not carry the reserved fields
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The inference function failed for a batch
    #[error("Inference error: {0}")]
    Inference(String),

    /// The inference function returned the wrong number of predictions
    #[error("Inference returned {actual} predictions for a batch of {expected}")]
    BatchMismatch { expected: usize, actual: usize },

    /// No matching response arrived before the deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Component has been shut down
    #[error("Shut down: {0}")]
    Shutdown(String),

    /// Retry budget exhausted
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnyInferError {
    /// Whether the error is worth retrying by reconnecting
    pub fn is_transient(&self) -> bool {
        matches!(self, AnyInferError::Transport(_) | AnyInferError::Io(_))
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        AnyInferError::Config(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        AnyInferError::Transport(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        AnyInferError::NotFound(msg.into())
    }

    /// Create a malformed message error
    pub fn malformed(msg: impl Into<String>) -> Self {
        AnyInferError::Malformed(msg.into())
    }

    /// Create an inference error
    pub fn inference(msg: impl Into<String>) -> Self {
        AnyInferError::Inference(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        AnyInferError::Timeout(msg.into())
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        AnyInferError::Shutdown(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        AnyInferError::Internal(msg.into())
    }
}

impl From<serde_yaml::Error> for AnyInferError {
    fn from(err: serde_yaml::Error) -> Self {
        AnyInferError::Config(err.to_string())
    }
}

impl From<config::ConfigError> for AnyInferError {
    fn from(err: config::ConfigError) -> Self {
        AnyInferError::Config(err.to_string())
    }
}

/// Result type alias for AnyInfer operations
pub type Result<T> = std::result::Result<T, AnyInferError>;
