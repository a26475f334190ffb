//! Webhook delivery for detection events.
//!
//! [`WebhookDispatcher`] accepts events from any thread without blocking and
//! posts them from a single task on the tokio runtime, retrying transient
//! transport failures with exponential backoff.

pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod retry;

pub use dispatcher::{DispatchOutcome, DispatchStats, SessionGate, WebhookDispatcher};
pub use error::{DeliveryError, DeliveryResult};
pub use retry::{FailureTracker, RetryConfig};
