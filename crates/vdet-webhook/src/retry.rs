//! Backoff policy and failure log suppression for webhook delivery.

use std::time::Duration;

use tracing::{info, warn};
use vdet_models::WebhookConfig;

/// Retry budget for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl From<&WebhookConfig> for RetryConfig {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0 for the first retry).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// Total attempts allowed for one event.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Tracks consecutive delivery failures so an endpoint outage doesn't flood
/// the logs.
#[derive(Debug)]
pub struct FailureTracker {
    consecutive_failures: u32,
    log_threshold: u32,
}

impl FailureTracker {
    pub fn new(log_threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            log_threshold,
        }
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > self.log_threshold {
            info!(
                failures = self.consecutive_failures,
                "Webhook endpoint recovered"
            );
        }
        self.consecutive_failures = 0;
    }

    /// Record a failed delivery. Returns `true` when it should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures == self.log_threshold + 1 {
            warn!(
                threshold = self.log_threshold,
                "Suppressing webhook failure logs until the endpoint recovers"
            );
        }
        self.consecutive_failures <= self.log_threshold
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}
