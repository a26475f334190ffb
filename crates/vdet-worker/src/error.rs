//! Pipeline error types.

use thiserror::Error;
use vdet_media::MediaError;
use vdet_models::{ConfigError, SessionState};
use vdet_webhook::DeliveryError;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Worker pool initialization failed; no stream can start.
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source unavailable for stream {stream_id}: {reason}")]
    SourceUnavailable { stream_id: String, reason: String },

    #[error("Detection failed: {0}")]
    Detection(String),

    #[error("Webhook error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Stream {0} already has an active session")]
    SessionExists(String),

    #[error("Session for stream {stream_id} is {state}, expected {expected}")]
    InvalidState {
        stream_id: String,
        state: SessionState,
        expected: SessionState,
    },

    #[error("Pipeline is shutting down")]
    ShuttingDown,

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    pub fn source_unavailable(stream_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            stream_id: stream_id.into(),
            reason: reason.into(),
        }
    }

    pub fn detection(msg: impl Into<String>) -> Self {
        Self::Detection(msg.into())
    }

    /// Process exit code for fatal errors in the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Setup(_) => 3,
            PipelineError::Config(_) => 2,
            _ => 1,
        }
    }
}
