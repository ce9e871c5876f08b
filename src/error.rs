//! Error handling module for stagehand
//!
//! Provides the error taxonomy shared by every part of the pipeline using thiserror.
//! Library code returns [`Result`]; the binary wraps it with anyhow at the edge.

use thiserror::Error;

/// Main error type for stagehand
#[derive(Error, Debug)]
pub enum StagehandError {
    /// IO errors (stage walking, databag files, processed output)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (scope nesting, start stage, malformed state files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A placeholder token could not be resolved
    #[error("Missing value for token '{token}': {reason}")]
    MissingValue { token: String, reason: String },

    /// A handler reported failure
    #[error("Handler failed for {file}: {reason}")]
    Handler { file: String, reason: String },

    /// Metadata manifest errors (tampering, hash mismatch, bad paths)
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Remote fetch errors
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for stagehand operations
pub type Result<T> = std::result::Result<T, StagehandError>;

// Convenient error constructors
impl StagehandError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a missing-value error for `token`
    pub fn missing_value(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MissingValue {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// Create a handler error for `file`
    pub fn handler(file: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        Self::Handler {
            file: file.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    /// Create a manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// Create a fetch error
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    /// True for errors a teardown run may log and continue past
    pub fn is_missing_value(&self) -> bool {
        matches!(self, Self::MissingValue { .. })
    }
}
