//! Webhook delivery metrics.

use metrics::{counter, histogram};

pub mod names {
    /// Delivery outcomes by result (delivered, failed).
    pub const DELIVERIES_TOTAL: &str = "vdet_webhook_deliveries_total";

    /// HTTP attempts including retries.
    pub const ATTEMPTS_TOTAL: &str = "vdet_webhook_attempts_total";

    /// Events discarded before delivery, by reason (queue_full, session_closed).
    pub const DISCARDED_TOTAL: &str = "vdet_webhook_discarded_total";

    /// Latency of successful deliveries in seconds.
    pub const LATENCY_SECONDS: &str = "vdet_webhook_latency_seconds";
}

pub fn record_delivery(outcome: &'static str) {
    counter!(names::DELIVERIES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_attempt() {
    counter!(names::ATTEMPTS_TOTAL).increment(1);
}

pub fn record_discard(reason: &'static str) {
    counter!(names::DISCARDED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_latency(latency_ms: f64) {
    histogram!(names::LATENCY_SECONDS).record(latency_ms / 1000.0);
}
