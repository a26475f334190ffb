//! Pipeline runtime: the entry point for starting and stopping streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;
use vdet_media::{DetectorBackend, FfmpegSourceProvider, OnnxBackend, SourceProvider};
use vdet_models::{PipelineConfig, SessionState, StreamConfig};
use vdet_webhook::{DispatchStats, WebhookDispatcher};

use crate::error::{PipelineError, PipelineResult};
use crate::pool::{PoolCell, PoolStats};
use crate::session::{SessionContext, SessionFailure, SessionHandle, SessionStats, StreamSession};

/// Snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub handle: SessionHandle,
    pub state: SessionState,
    pub stats: SessionStats,
    pub failure: Option<SessionFailure>,
}

/// Snapshot of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    /// `None` until the first session initialized the pool
    pub pool: Option<PoolStats>,
    pub webhook: DispatchStats,
    pub sessions: Vec<SessionInfo>,
}

/// Owns the sessions of one process and the collaborators they share.
pub struct PipelineRuntime {
    context: SessionContext,
    sessions: Mutex<HashMap<SessionHandle, Arc<StreamSession>>>,
    shutting_down: AtomicBool,
}

impl PipelineRuntime {
    /// Runtime with the ONNX backend, FFmpeg sources and the process-wide pool.
    pub fn new(config: PipelineConfig, dispatcher: Arc<WebhookDispatcher>) -> Self {
        Self {
            context: SessionContext {
                config: Arc::new(config),
                pool: PoolCell::global(),
                backend: Arc::new(OnnxBackend),
                sources: Arc::new(FfmpegSourceProvider),
                dispatcher,
            },
            sessions: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn DetectorBackend>) -> Self {
        self.context.backend = backend;
        self
    }

    pub fn with_source_provider(mut self, sources: Arc<dyn SourceProvider>) -> Self {
        self.context.sources = sources;
        self
    }

    /// Use a private pool cell instead of the process-wide one.
    pub fn with_pool_cell(mut self, pool: Arc<PoolCell>) -> Self {
        self.context.pool = pool;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.context.config
    }

    /// Start a session for `stream`.
    ///
    /// Fails on invalid stream configuration, when the stream already has an
    /// active session, or when the shared pool cannot be initialized.
    pub fn start(&self, stream: &StreamConfig) -> PipelineResult<SessionHandle> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PipelineError::ShuttingDown);
        }
        self.context.config.validate_stream(stream)?;

        let session = Arc::new(StreamSession::new(stream.clone(), self.context.clone()));
        let handle = session.handle().clone();
        {
            // Registering the Created session reserves the stream id
            let mut sessions = self.lock_sessions();
            let active = sessions
                .values()
                .any(|s| s.stream().id == stream.id && !s.state().is_terminal());
            if active {
                return Err(PipelineError::SessionExists(stream.id.clone()));
            }
            sessions.insert(handle.clone(), Arc::clone(&session));
        }

        // Pool initialization may load models; don't hold the registry meanwhile
        if let Err(e) = session.start() {
            self.lock_sessions().remove(&handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Start every stream listed in the configuration.
    ///
    /// Returns one result per configured stream, in configuration order.
    pub fn start_configured(&self) -> Vec<(String, PipelineResult<SessionHandle>)> {
        let streams = self.context.config.streams.clone();
        streams
            .iter()
            .map(|stream| (stream.id.clone(), self.start(stream)))
            .collect()
    }

    /// Stop a session, waiting at most the configured grace period.
    pub fn stop(&self, handle: &SessionHandle) -> PipelineResult<()> {
        let session = self
            .session(handle)
            .ok_or_else(|| PipelineError::SessionNotFound(handle.to_string()))?;
        session.stop()
    }

    pub fn state(&self, handle: &SessionHandle) -> Option<SessionState> {
        self.session(handle).map(|s| s.state())
    }

    /// Failure cause of a `Failed` session.
    pub fn failure(&self, handle: &SessionHandle) -> Option<SessionFailure> {
        self.session(handle).and_then(|s| s.failure())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .lock_sessions()
            .values()
            .map(|s| SessionInfo {
                handle: s.handle().clone(),
                state: s.state(),
                stats: s.stats(),
                failure: s.failure(),
            })
            .collect();
        infos.sort_by(|a, b| a.handle.stream_id.cmp(&b.handle.stream_id));
        infos
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            pool: self.context.pool.get().map(|p| p.stats()),
            webhook: self.context.dispatcher.stats(),
            sessions: self.sessions(),
        }
    }

    /// Stop every session, shut the pool down and close the dispatcher.
    ///
    /// Sessions are signalled together and share one stop grace period; the
    /// pool then gets its own drain grace period.
    pub fn shutdown(&self) -> RuntimeStats {
        self.shutting_down.store(true, Ordering::Release);
        info!("Shutting down pipeline runtime");

        let sessions: Vec<Arc<StreamSession>> = self.lock_sessions().values().cloned().collect();
        for session in &sessions {
            session.request_stop();
        }

        let deadline = Instant::now() + self.context.config.session.stop_grace();
        for session in &sessions {
            let remaining = deadline.saturating_duration_since(Instant::now());
            session.wait_stopped(remaining.max(Duration::from_millis(1)));
        }

        if let Some(pool) = self.context.pool.get() {
            pool.shutdown(self.context.config.pool.shutdown_grace());
        }
        self.context.dispatcher.close();

        let stats = self.stats();
        info!(sessions = stats.sessions.len(), "Pipeline runtime stopped");
        stats
    }

    fn session(&self, handle: &SessionHandle) -> Option<Arc<StreamSession>> {
        self.lock_sessions().get(handle).cloned()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionHandle, Arc<StreamSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
