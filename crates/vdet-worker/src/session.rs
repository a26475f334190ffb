//! Stream sessions.
//!
//! A [`StreamSession`] owns one stream's lifecycle:
//! `Created → Starting → Running → Stopping → Stopped`, or `Failed`.
//! Starting initializes the shared pool if needed and spawns the pull thread;
//! the pull thread opens the source, then submits one job per frame until the
//! session is stopped or the source is gone for good.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use uuid::Uuid;
use vdet_media::{
    DetectorBackend, FrameSource, MediaError, ReconnectPolicy, ReconnectingSource,
    RegionClassFilter, SourceOptions, SourceProvider,
};
use vdet_models::{AtomicSessionState, DetectionResult, PipelineConfig, SessionState, StreamConfig};
use vdet_webhook::{DispatchOutcome, SessionGate, WebhookDispatcher};

use crate::error::{PipelineError, PipelineResult};
use crate::job::{DetectionJob, JobOutcome, SubmitOutcome};
use crate::logging::SessionLogger;
use crate::metrics;
use crate::pool::{DetectionWorkerPool, PoolCell};
use crate::reorder::ReorderBuffer;

/// Identifies one session of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionHandle {
    pub id: Uuid,
    pub stream_id: String,
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.id)
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SessionFailure {
    /// Pool initialization or decoder setup failed
    Setup(String),
    /// The source could not be opened or kept open within the retry budget
    SourceUnavailable(String),
    /// Any other unrecoverable source error
    Source(String),
}

impl SessionFailure {
    fn from_media(err: MediaError) -> Self {
        match err {
            MediaError::SourceUnavailable { .. } => Self::SourceUnavailable(err.to_string()),
            MediaError::FfmpegNotFound => Self::Setup(err.to_string()),
            other => Self::Source(other.to_string()),
        }
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFailure::Setup(msg) => write!(f, "setup failed: {}", msg),
            SessionFailure::SourceUnavailable(msg) => write!(f, "{}", msg),
            SessionFailure::Source(msg) => write!(f, "source error: {}", msg),
        }
    }
}

/// Per-session counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_pulled: u64,
    pub jobs_accepted: u64,
    /// Frames rejected by the pool (queue full or closed)
    pub frames_dropped: u64,
    /// Qualifying results handed to the webhook dispatcher
    pub results_delivered: u64,
    /// Results thrown away: late, after stop, failed or refused by the dispatcher
    pub results_discarded: u64,
    pub results_late: u64,
    pub detection_failures: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_pulled: AtomicU64,
    jobs_accepted: AtomicU64,
    frames_dropped: AtomicU64,
    results_delivered: AtomicU64,
    results_discarded: AtomicU64,
    results_late: AtomicU64,
    detection_failures: AtomicU64,
    reconnects: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_pulled: self.frames_pulled.load(Ordering::Relaxed),
            jobs_accepted: self.jobs_accepted.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            results_delivered: self.results_delivered.load(Ordering::Relaxed),
            results_discarded: self.results_discarded.load(Ordering::Relaxed),
            results_late: self.results_late.load(Ordering::Relaxed),
            detection_failures: self.detection_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Collaborators shared by every session of a runtime.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<PipelineConfig>,
    pub pool: Arc<PoolCell>,
    pub backend: Arc<dyn DetectorBackend>,
    pub sources: Arc<dyn SourceProvider>,
    pub dispatcher: Arc<WebhookDispatcher>,
}

/// State shared between the session controller, its pull thread and the
/// workers completing its jobs.
struct Shared {
    state: AtomicSessionState,
    running: Arc<AtomicBool>,
    gate: SessionGate,
    counters: Counters,
    failure: Mutex<Option<SessionFailure>>,
    logger: SessionLogger,
}

impl Shared {
    fn fail(&self, failure: SessionFailure) {
        self.logger.log_failure(&failure.to_string());
        self.running.store(false, Ordering::Release);
        self.gate.close();
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(failure);

        // A concurrent stop() already moved us to Stopping
        if self.state.transition(SessionState::Failed).is_err() {
            let _ = self.state.transition(SessionState::Stopped);
        }
    }

    fn finish(&self) {
        self.running.store(false, Ordering::Release);
        self.gate.close();
        let _ = self.state.transition(SessionState::Stopping);
        let _ = self.state.transition(SessionState::Stopped);

        let stats = self.counters.snapshot();
        self.logger
            .log_stopped(stats.frames_pulled, stats.results_delivered);
    }
}

/// One stream's detection session.
pub struct StreamSession {
    handle: SessionHandle,
    stream: StreamConfig,
    context: SessionContext,
    shared: Arc<Shared>,
    done: Mutex<Option<Receiver<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    pub fn new(stream: StreamConfig, context: SessionContext) -> Self {
        let handle = SessionHandle {
            id: Uuid::new_v4(),
            stream_id: stream.id.clone(),
        };
        let logger = SessionLogger::new(handle.id.to_string(), stream.id.clone());

        Self {
            handle,
            stream,
            context,
            shared: Arc::new(Shared {
                state: AtomicSessionState::new(SessionState::Created),
                running: Arc::new(AtomicBool::new(true)),
                gate: SessionGate::new(),
                counters: Counters::default(),
                failure: Mutex::new(None),
                logger,
            }),
            done: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn stream(&self) -> &StreamConfig {
        &self.stream
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.load()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Cause of the failure, once the session is `Failed`.
    pub fn failure(&self) -> Option<SessionFailure> {
        self.shared
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move to `Starting`, make sure the shared pool exists and spawn the
    /// pull thread.
    ///
    /// Returns once the thread is running; the source is opened on that
    /// thread, so a source that never comes up shows as `Failed` later rather
    /// than as an error here.
    pub fn start(&self) -> PipelineResult<()> {
        self.shared
            .state
            .transition(SessionState::Starting)
            .map_err(|state| PipelineError::InvalidState {
                stream_id: self.stream.id.clone(),
                state,
                expected: SessionState::Created,
            })?;

        self.shared
            .logger
            .log_start(&self.stream.url, &self.stream.model);

        match self.spawn_pull_thread() {
            Ok(()) => Ok(()),
            Err(e) => {
                let failure = match &e {
                    PipelineError::SourceUnavailable { reason, .. } => {
                        SessionFailure::SourceUnavailable(reason.clone())
                    }
                    other => SessionFailure::Setup(other.to_string()),
                };
                self.shared.fail(failure);
                Err(e)
            }
        }
    }

    fn spawn_pull_thread(&self) -> PipelineResult<()> {
        let ctx = &self.context;
        let config = &ctx.config;

        let pool = ctx.pool.get_or_try_init(|| {
            DetectionWorkerPool::initialize(&config.models, &config.pool, ctx.backend.as_ref())
        })?;

        let model = pool.model_index(&self.stream.model).ok_or_else(|| {
            PipelineError::setup(format!(
                "model {} is not loaded in the worker pool",
                self.stream.model
            ))
        })?;

        let filter = Arc::new(RegionClassFilter::new(
            self.stream.regions.clone(),
            config.classes_for(&self.stream),
            config.region_match,
        ));

        let options = SourceOptions::new(&self.stream, &config.session, config.transport_for(&self.stream));
        let inner = ctx.sources.create(options)?;
        let source = ReconnectingSource::new(
            self.stream.id.clone(),
            inner,
            ReconnectPolicy::from(&config.session.reconnect),
            Arc::clone(&self.shared.running),
        );

        let sink = Arc::new(ResultSink {
            shared: Arc::clone(&self.shared),
            dispatcher: Arc::clone(&ctx.dispatcher),
            reorder: Mutex::new(ReorderBuffer::new(config.session.reorder_window)),
        });

        let (done_tx, done_rx) = bounded::<()>(0);
        let pull = PullLoop {
            shared: Arc::clone(&self.shared),
            source,
            pool,
            model,
            filter,
            sink,
            _done: done_tx,
        };

        let thread = thread::Builder::new()
            .name(format!("vdet-pull-{}", self.stream.id))
            .spawn(move || pull.run())?;

        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = Some(done_rx);
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread);
        Ok(())
    }

    /// Signal the pull loop to stop. Returns `false` when there was nothing to
    /// stop (already stopping or terminal).
    ///
    /// A session that was never started has no pull loop and goes straight to
    /// `Stopped`.
    pub fn request_stop(&self) -> bool {
        loop {
            match self.shared.state.transition(SessionState::Stopping) {
                Ok(_) => {
                    self.shared.running.store(false, Ordering::Release);
                    self.shared.gate.close();
                    return true;
                }
                Err(SessionState::Created) => {
                    // Lost to a concurrent start when this fails; try again
                    if self.shared.state.transition(SessionState::Stopped).is_ok() {
                        self.shared.running.store(false, Ordering::Release);
                        self.shared.gate.close();
                        self.shared.logger.log_stopped(0, 0);
                        return true;
                    }
                }
                Err(_) => return false,
            }
        }
    }

    /// Wait up to `grace` for the pull thread to exit. Returns `true` when it
    /// has exited.
    pub fn wait_stopped(&self, grace: Duration) -> bool {
        let done = self
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(done) = done else {
            return self.state().is_terminal();
        };

        match done.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let thread = self
                    .thread
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(thread) = thread {
                    let _ = thread.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                self.shared.logger.log_warning(&format!(
                    "pull thread still busy after {} ms, leaving it to finish",
                    grace.as_millis()
                ));
                *self.done.lock().unwrap_or_else(PoisonError::into_inner) = Some(done);
                false
            }
        }
    }

    /// Stop the session, waiting at most the configured grace period.
    ///
    /// A no-op on sessions that are already `Stopped` or `Failed`.
    pub fn stop(&self) -> PipelineResult<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.request_stop();
        self.wait_stopped(self.context.config.session.stop_grace());
        Ok(())
    }
}

struct PullLoop {
    shared: Arc<Shared>,
    source: ReconnectingSource,
    pool: Arc<DetectionWorkerPool>,
    model: usize,
    filter: Arc<RegionClassFilter>,
    sink: Arc<ResultSink>,
    /// Dropped when the loop exits, waking `wait_stopped`
    _done: Sender<()>,
}

impl PullLoop {
    fn run(mut self) {
        let span = self.shared.logger.span();
        let _entered = span.enter();

        match self.source.open() {
            Ok(()) => {}
            Err(MediaError::Cancelled) => {
                self.source.close();
                self.shared.finish();
                return;
            }
            Err(e) => {
                self.source.close();
                self.shared.fail(SessionFailure::from_media(e));
                return;
            }
        }

        if self.shared.state.transition(SessionState::Running).is_err() {
            // Stopped while the source was opening
            self.source.close();
            self.shared.finish();
            return;
        }

        self.shared.logger.log_running();
        metrics::session_running();
        let failure = self.pull();
        metrics::session_left_running();

        self.source.close();
        match failure {
            Some(failure) => self.shared.fail(failure),
            None => self.shared.finish(),
        }
    }

    fn pull(&mut self) -> Option<SessionFailure> {
        let counters = &self.shared.counters;
        let stream_id = self.shared.logger.stream_id().to_string();

        while self.shared.running.load(Ordering::Acquire) {
            let frame = match self.source.next_frame() {
                Ok(frame) => frame,
                Err(MediaError::Cancelled) => return None,
                Err(e) => return Some(SessionFailure::from_media(e)),
            };

            counters
                .reconnects
                .store(self.source.reconnects(), Ordering::Relaxed);
            Counters::bump(&counters.frames_pulled);
            metrics::record_frame_pulled(&stream_id);

            if !self.shared.running.load(Ordering::Acquire) {
                return None;
            }

            let sequence = frame.sequence;
            let sink = Arc::clone(&self.sink);
            let job = DetectionJob::new(frame, self.model, Arc::clone(&self.filter), move |outcome| {
                sink.accept(outcome)
            });

            match self.pool.submit_while(job, &self.shared.running) {
                SubmitOutcome::Accepted => Counters::bump(&counters.jobs_accepted),
                SubmitOutcome::Dropped => {
                    Counters::bump(&counters.frames_dropped);
                    metrics::record_frame_dropped(&stream_id);
                    self.sink.skip(sequence);
                }
                SubmitOutcome::Closed => {
                    Counters::bump(&counters.frames_dropped);
                    metrics::record_frame_dropped(&stream_id);
                    self.sink.skip(sequence);
                    self.shared
                        .logger
                        .log_warning("detection pool closed, ending session");
                    return None;
                }
                SubmitOutcome::Cancelled => {
                    self.sink.skip(sequence);
                    return None;
                }
            }
        }
        None
    }
}

/// Receives job outcomes for one session, restores frame order and hands
/// qualifying results to the dispatcher.
struct ResultSink {
    shared: Arc<Shared>,
    dispatcher: Arc<WebhookDispatcher>,
    reorder: Mutex<ReorderBuffer<DetectionResult>>,
}

impl ResultSink {
    fn accept(&self, outcome: JobOutcome) {
        let counters = &self.shared.counters;
        // Released results are dispatched under the lock so that concurrent
        // workers can't interleave them out of order.
        let mut reorder = self.reorder.lock().unwrap_or_else(PoisonError::into_inner);

        let ready = match outcome {
            JobOutcome::Completed(result) => {
                if reorder.is_late(result.sequence) {
                    Counters::bump(&counters.results_late);
                    Counters::bump(&counters.results_discarded);
                    metrics::record_late_result(&result.stream_id);
                    return;
                }
                reorder.push(result.sequence, result)
            }
            JobOutcome::Failed { sequence, .. } => {
                Counters::bump(&counters.detection_failures);
                Counters::bump(&counters.results_discarded);
                reorder.skip(sequence)
            }
            JobOutcome::Discarded { sequence, .. } => {
                Counters::bump(&counters.results_discarded);
                reorder.skip(sequence)
            }
        };

        self.release(ready);
    }

    fn skip(&self, sequence: u64) {
        let mut reorder = self.reorder.lock().unwrap_or_else(PoisonError::into_inner);
        let ready = reorder.skip(sequence);
        self.release(ready);
    }

    fn release(&self, ready: Vec<DetectionResult>) {
        let counters = &self.shared.counters;
        let gate = &self.shared.gate;

        for result in ready {
            if !gate.is_open() {
                Counters::bump(&counters.results_discarded);
                continue;
            }
            if !result.is_qualifying() {
                continue;
            }
            match self.dispatcher.dispatch(result.into_event(), Some(gate)) {
                DispatchOutcome::Queued => Counters::bump(&counters.results_delivered),
                DispatchOutcome::Dropped | DispatchOutcome::Closed => {
                    Counters::bump(&counters.results_discarded)
                }
            }
        }
    }
}
