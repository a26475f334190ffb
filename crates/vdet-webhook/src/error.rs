//! Webhook delivery errors.

use thiserror::Error;

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Invalid webhook endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Endpoint returned HTTP {status}")]
    Status { status: u16 },

    #[error("Failed to build request: {0}")]
    Request(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl DeliveryError {
    /// Transient failures worth another attempt.
    ///
    /// Only transport-level failures are retried. Any HTTP response, including
    /// 5xx, means the endpoint received the event and made a decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transport(_) | DeliveryError::Timeout(_))
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            DeliveryError::Request(err.to_string())
        } else if err.is_timeout() {
            DeliveryError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            DeliveryError::Status {
                status: status.as_u16(),
            }
        } else {
            DeliveryError::Transport(err.to_string())
        }
    }
}
