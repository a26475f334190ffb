//! Configuration error types.

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while validating a pipeline configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("No models configured")]
    NoModels,

    #[error("Duplicate model name: {0}")]
    DuplicateModel(String),

    #[error("Duplicate stream id: {0}")]
    DuplicateStream(String),

    #[error("Stream {stream} references unknown model {model}")]
    UnknownModel { stream: String, model: String },

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Invalid polygon for stream {stream}: {reason}")]
    InvalidRegion { stream: String, reason: String },

    #[error("Invalid webhook endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to read configuration: {0}")]
    Read(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_region(stream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRegion {
            stream: stream.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
