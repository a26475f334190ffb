//! Reconnect wrapper for frame sources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use vdet_models::{Frame, ReconnectConfig};

use super::FrameSource;
use crate::error::{MediaError, MediaResult};

/// Granularity of the running-flag check during backoff.
const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Bounded exponential backoff for re-opening a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts allowed between two successful frames
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (0-indexed): base * 2^attempt, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Wraps a [`FrameSource`] with reconnects and continuous frame numbering.
///
/// Sequence numbers keep counting across reconnects and timestamps never go
/// below the previous frame's. The retry budget is reset by every delivered
/// frame, so only consecutive failures count against it.
pub struct ReconnectingSource {
    stream_id: String,
    inner: Box<dyn FrameSource>,
    policy: ReconnectPolicy,
    running: Arc<AtomicBool>,
    opened: bool,
    attempts: u32,
    next_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
    reconnects: u64,
}

impl ReconnectingSource {
    pub fn new(
        stream_id: impl Into<String>,
        inner: Box<dyn FrameSource>,
        policy: ReconnectPolicy,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            inner,
            policy,
            running,
            opened: false,
            attempts: 0,
            next_sequence: 0,
            last_timestamp: None,
            reconnects: 0,
        }
    }

    /// Successful re-opens after a failure.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn stamp(&mut self, mut frame: Frame) -> Frame {
        frame.sequence = self.next_sequence;
        self.next_sequence += 1;

        if let Some(last) = self.last_timestamp {
            if frame.timestamp < last {
                frame.timestamp = last;
            }
        }
        self.last_timestamp = Some(frame.timestamp);
        frame
    }

    fn sleep_interruptible(&self, delay: Duration) -> MediaResult<()> {
        let deadline = Instant::now() + delay;
        loop {
            if !self.is_running() {
                return Err(MediaError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    /// Re-open with backoff until it succeeds or the budget runs out.
    fn recover(&mut self, cause: MediaError) -> MediaResult<()> {
        let mut last_error = cause;

        loop {
            if self.attempts >= self.policy.max_retries {
                warn!(
                    stream_id = %self.stream_id,
                    attempts = self.attempts,
                    "Reconnect budget exhausted: {}",
                    last_error
                );
                return Err(MediaError::source_unavailable(
                    self.inner.url(),
                    format!(
                        "gave up after {} reconnect attempts: {}",
                        self.attempts, last_error
                    ),
                ));
            }

            let delay = self.policy.delay_for_attempt(self.attempts);
            self.attempts += 1;

            warn!(
                stream_id = %self.stream_id,
                attempt = self.attempts,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Source failed, reconnecting: {}",
                last_error
            );

            self.sleep_interruptible(delay)?;

            match self.inner.open() {
                Ok(()) => {
                    self.opened = true;
                    self.reconnects += 1;
                    metrics::counter!("vdet_source_reconnects_total", "stream_id" => self.stream_id.clone())
                        .increment(1);
                    info!(
                        stream_id = %self.stream_id,
                        attempt = self.attempts,
                        "Source reconnected"
                    );
                    return Ok(());
                }
                Err(MediaError::FfmpegNotFound) => return Err(MediaError::FfmpegNotFound),
                Err(e) => last_error = e,
            }
        }
    }
}

impl FrameSource for ReconnectingSource {
    fn open(&mut self) -> MediaResult<()> {
        if !self.is_running() {
            return Err(MediaError::Cancelled);
        }

        match self.inner.open() {
            Ok(()) => {
                self.opened = true;
                Ok(())
            }
            Err(MediaError::FfmpegNotFound) => Err(MediaError::FfmpegNotFound),
            Err(e) => self.recover(e),
        }
    }

    fn next_frame(&mut self) -> MediaResult<Frame> {
        loop {
            if !self.is_running() {
                return Err(MediaError::Cancelled);
            }

            if !self.opened {
                self.recover(MediaError::decode("source not open"))?;
            }

            match self.inner.next_frame() {
                Ok(frame) => {
                    self.attempts = 0;
                    return Ok(self.stamp(frame));
                }
                Err(e) if e.is_reconnectable() => {
                    self.inner.close();
                    self.opened = false;
                    if !self.is_running() {
                        return Err(MediaError::Cancelled);
                    }
                    self.recover(e)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) {
        self.inner.close();
        self.opened = false;
    }

    fn url(&self) -> &str {
        self.inner.url()
    }
}
