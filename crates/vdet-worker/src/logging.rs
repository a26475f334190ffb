//! Structured session logging and subscriber setup.
//!
//! Gives every session lifecycle line the same fields so a stream can be
//! followed through the logs.

use tracing::{error, info, warn, Span};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `RUST_LOG` plus the worker's own defaults; inference runtimes stay quiet.
pub fn env_filter() -> Result<EnvFilter, ParseError> {
    Ok(EnvFilter::from_default_env()
        .add_directive("vdet=info".parse()?)
        .add_directive("ort=warn".parse()?)
        .add_directive("onnxruntime=warn".parse()?))
}

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines.
///
/// Call this before anything else that can fail, so startup errors are
/// logged.
pub fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);
    let env_filter = env_filter()?;

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .try_init()?;
    }
    Ok(())
}

/// Logger bound to one stream session.
#[derive(Debug, Clone)]
pub struct SessionLogger {
    session_id: String,
    stream_id: String,
}

impl SessionLogger {
    pub fn new(session_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            stream_id: stream_id.into(),
        }
    }

    pub fn log_start(&self, url: &str, model: &str) {
        info!(
            session_id = %self.session_id,
            stream_id = %self.stream_id,
            url = %url,
            model = %model,
            "Session starting"
        );
    }

    pub fn log_running(&self) {
        info!(
            session_id = %self.session_id,
            stream_id = %self.stream_id,
            "Session running"
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            session_id = %self.session_id,
            stream_id = %self.stream_id,
            "Session warning: {}", message
        );
    }

    pub fn log_failure(&self, message: &str) {
        error!(
            session_id = %self.session_id,
            stream_id = %self.stream_id,
            "Session failed: {}", message
        );
    }

    pub fn log_stopped(&self, frames: u64, delivered: u64) {
        info!(
            session_id = %self.session_id,
            stream_id = %self.stream_id,
            frames,
            delivered,
            "Session stopped"
        );
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Span covering the session's pull thread.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "session",
            session_id = %self.session_id,
            stream_id = %self.stream_id
        )
    }
}
