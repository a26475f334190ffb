//! Webhook dispatcher.
//!
//! Callers hand events to [`WebhookDispatcher::dispatch`], which never blocks:
//! events go into a bounded queue and a full queue drops the event. A single
//! delivery task posts queued events in FIFO order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use vdet_models::{DetectionEvent, WebhookConfig};

use crate::error::{DeliveryError, DeliveryResult};
use crate::metrics;
use crate::retry::{FailureTracker, RetryConfig};

/// Consecutive failures logged before the tracker suppresses further logs.
const FAILURE_LOG_THRESHOLD: u32 = 5;

/// Open/closed flag tying queued events to the session that produced them.
///
/// Closing the gate discards the session's events that have not been
/// attempted yet, including ones already waiting in the queue.
#[derive(Debug, Clone)]
pub struct SessionGate(Arc<AtomicBool>);

impl SessionGate {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of handing an event to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued,
    /// Queue full; the event was dropped
    Dropped,
    /// Dispatcher closed; the event was dropped
    Closed,
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub delivered: u64,
    /// Permanent failures and exhausted retry budgets
    pub failed: u64,
    /// Rejected because the queue was full or closed
    pub dropped: u64,
    /// Discarded because the owning session closed its gate
    pub suppressed: u64,
    /// HTTP attempts including retries
    pub attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    suppressed: AtomicU64,
    attempts: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
        }
    }
}

struct Envelope {
    event: DetectionEvent,
    gate: Option<SessionGate>,
}

impl Envelope {
    fn is_open(&self) -> bool {
        self.gate.as_ref().map_or(true, SessionGate::is_open)
    }
}

/// Non-blocking, bounded webhook dispatcher.
pub struct WebhookDispatcher {
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    endpoint: Url,
}

impl WebhookDispatcher {
    /// Validate the endpoint, build the HTTP client and spawn the delivery
    /// task on `runtime`.
    pub fn start(config: &WebhookConfig, runtime: &Handle) -> DeliveryResult<Self> {
        let endpoint = config
            .endpoint()
            .map_err(|e| DeliveryError::InvalidEndpoint {
                url: config.url.clone(),
                reason: e.to_string(),
            })?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| DeliveryError::Client(e.to_string()))?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());

        let delivery = DeliveryLoop {
            client,
            endpoint: endpoint.clone(),
            retry: RetryConfig::from(config),
            counters: Arc::clone(&counters),
            failures: FailureTracker::new(FAILURE_LOG_THRESHOLD),
        };
        let task = runtime.spawn(delivery.run(rx));

        info!(
            endpoint = %endpoint,
            queue_capacity = config.queue_capacity,
            max_retries = config.max_retries,
            "Webhook dispatcher started"
        );

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
            counters,
            endpoint,
        })
    }

    /// Queue an event for delivery. Never blocks.
    pub fn dispatch(&self, event: DetectionEvent, gate: Option<&SessionGate>) -> DispatchOutcome {
        let envelope = Envelope {
            event,
            gate: gate.cloned(),
        };

        let result = match self.sender.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => tx.try_send(envelope),
                None => Err(TrySendError::Closed(envelope)),
            },
            Err(_) => Err(TrySendError::Closed(envelope)),
        };

        match result {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Queued
            }
            Err(TrySendError::Full(envelope)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_discard("queue_full");
                debug!(
                    stream_id = %envelope.event.stream_id,
                    sequence = envelope.event.sequence,
                    "Webhook queue full, dropping event"
                );
                DispatchOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_discard("closed");
                DispatchOutcome::Closed
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Stop accepting events. Already queued events are still delivered.
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    /// Close and wait up to `grace` for queued events to drain; whatever is
    /// left after that is abandoned.
    pub async fn shutdown(&self, grace: Duration) {
        self.close();

        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(mut task) = task else {
            return;
        };

        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Webhook queue not drained within grace period, abandoning remaining events"
            );
            task.abort();
        }

        let stats = self.stats();
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            suppressed = stats.suppressed,
            "Webhook dispatcher stopped"
        );
    }
}

struct DeliveryLoop {
    client: Client,
    endpoint: Url,
    retry: RetryConfig,
    counters: Arc<Counters>,
    failures: FailureTracker,
}

impl DeliveryLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            self.deliver(envelope).await;
        }
        debug!("Webhook delivery loop finished");
    }

    async fn deliver(&mut self, envelope: Envelope) {
        let mut retry = 0u32;

        loop {
            if !envelope.is_open() {
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                metrics::record_discard("session_closed");
                debug!(
                    stream_id = %envelope.event.stream_id,
                    sequence = envelope.event.sequence,
                    "Session closed, discarding event"
                );
                return;
            }

            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            metrics::record_attempt();
            let started = Instant::now();

            match self.post(&envelope.event).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    metrics::record_delivery("delivered");
                    metrics::record_latency(started.elapsed().as_secs_f64() * 1000.0);
                    self.failures.record_success();
                    debug!(
                        stream_id = %envelope.event.stream_id,
                        sequence = envelope.event.sequence,
                        event_id = %envelope.event.event_id,
                        "Webhook delivered"
                    );
                    return;
                }
                Err(e) if e.is_retryable() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(retry);
                    retry += 1;
                    debug!(
                        stream_id = %envelope.event.stream_id,
                        attempt = retry,
                        delay_ms = delay.as_millis() as u64,
                        "Webhook delivery failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    metrics::record_delivery("failed");
                    if self.failures.record_failure() {
                        warn!(
                            stream_id = %envelope.event.stream_id,
                            sequence = envelope.event.sequence,
                            attempts = retry + 1,
                            "Dropping webhook event: {}",
                            e
                        );
                    }
                    return;
                }
            }
        }
    }

    async fn post(&self, event: &DetectionEvent) -> DeliveryResult<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status {
                status: status.as_u16(),
            })
        }
    }
}
