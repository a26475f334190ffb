//! Shared detection worker pool.
//!
//! A fixed set of OS threads drains one bounded job queue. Models are loaded
//! once during initialization; backends that cannot serve concurrent
//! inference from one handle get a private handle per worker. The pool is
//! shared by every session through a [`PoolCell`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, info, warn};
use vdet_media::{Detector, DetectorBackend};
use vdet_models::{DetectionResult, ModelConfig, PoolConfig, QueuePolicy};

use crate::error::{PipelineError, PipelineResult};
use crate::job::{DetectionJob, JobOutcome, SubmitOutcome};
use crate::metrics;

/// How often a blocked submitter re-checks whether it should give up.
const BLOCK_POLL: Duration = Duration::from_millis(50);

/// Extra wait for in-flight inference after the grace period, before workers
/// are detached.
const DETACH_WAIT: Duration = Duration::from_millis(100);

/// Pool counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub submitted: u64,
    pub accepted: u64,
    /// Rejected because the queue was full
    pub dropped: u64,
    /// Rejected because the pool was shutting down
    pub rejected: u64,
    /// Abandoned by a submitter that stopped while waiting for space
    pub cancelled: u64,
    pub completed: u64,
    pub failed: u64,
    /// Accepted but abandoned at shutdown
    pub discarded: u64,
    pub queue_depth: usize,
    pub workers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

/// The shared worker pool.
pub struct DetectionWorkerPool {
    sender: RwLock<Option<Sender<DetectionJob>>>,
    receiver: Receiver<DetectionJob>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    models: Vec<String>,
    policy: QueuePolicy,
    accepting: AtomicBool,
    discard: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl DetectionWorkerPool {
    /// Load every model and start the workers.
    ///
    /// Fails with `Setup` if any model fails to load; nothing is started in
    /// that case.
    pub fn initialize(
        models: &[ModelConfig],
        config: &PoolConfig,
        backend: &dyn DetectorBackend,
    ) -> PipelineResult<Self> {
        if models.is_empty() {
            return Err(PipelineError::setup("no models configured"));
        }
        if config.worker_threads == 0 || config.queue_capacity == 0 {
            return Err(PipelineError::setup(
                "worker_threads and queue_capacity must be positive",
            ));
        }

        let started = Instant::now();
        let shared = backend.supports_shared_inference();
        info!(
            backend = backend.name(),
            models = models.len(),
            worker_threads = config.worker_threads,
            queue_capacity = config.queue_capacity,
            queue_policy = ?config.queue_policy,
            shared_inference = shared,
            "Initializing detection worker pool"
        );

        let detector_sets: Vec<Arc<[Arc<dyn Detector>]>> = if shared {
            let set = load_models(models, backend)?;
            vec![set; config.worker_threads]
        } else {
            (0..config.worker_threads)
                .map(|_| load_models(models, backend))
                .collect::<PipelineResult<_>>()?
        };

        let (sender, receiver) = bounded::<DetectionJob>(config.queue_capacity);
        let counters = Arc::new(Counters::default());
        let discard = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_threads);
        for (index, detectors) in detector_sets.into_iter().enumerate() {
            let worker = Worker {
                index,
                receiver: receiver.clone(),
                detectors,
                counters: Arc::clone(&counters),
                discard: Arc::clone(&discard),
            };
            let handle = thread::Builder::new()
                .name(format!("vdet-worker-{}", index))
                .spawn(move || worker.run());

            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Disconnect the queue so already spawned workers exit
                    drop(sender);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(PipelineError::setup(format!(
                        "failed to spawn worker thread: {}",
                        e
                    )));
                }
            }
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Detection worker pool ready"
        );

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            worker_count: workers.len(),
            workers: Mutex::new(workers),
            models: models.iter().map(|m| m.name.clone()).collect(),
            policy: config.queue_policy,
            accepting: AtomicBool::new(true),
            discard,
            counters,
        })
    }

    /// Position of a model in load order.
    pub fn model_index(&self, name: &str) -> Option<usize> {
        self.models.iter().position(|m| m == name)
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Offer a job to the queue.
    ///
    /// Under `DropNewest` this never blocks: a full queue rejects the incoming
    /// job. Under `Block` it waits for space, giving up if shutdown begins.
    /// Accepted jobs are never evicted.
    pub fn submit(&self, job: DetectionJob) -> SubmitOutcome {
        self.submit_inner(job, None)
    }

    /// Like [`DetectionWorkerPool::submit`], but a submitter blocked under
    /// `Block` gives up with `Cancelled` once `running` turns false.
    pub fn submit_while(&self, job: DetectionJob, running: &AtomicBool) -> SubmitOutcome {
        self.submit_inner(job, Some(running))
    }

    fn submit_inner(&self, job: DetectionJob, running: Option<&AtomicBool>) -> SubmitOutcome {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let sender = match self.sender.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender.filter(|_| self.is_accepting()) else {
            return self.reject();
        };

        let outcome = match self.policy {
            QueuePolicy::DropNewest => match sender.try_send(job) {
                Ok(()) => SubmitOutcome::Accepted,
                Err(TrySendError::Full(job)) => {
                    debug!(
                        stream_id = %job.stream_id(),
                        sequence = job.sequence(),
                        "Job queue full, dropping frame"
                    );
                    SubmitOutcome::Dropped
                }
                Err(TrySendError::Disconnected(_)) => SubmitOutcome::Closed,
            },
            QueuePolicy::Block => self.send_blocking(&sender, job, running),
        };

        match outcome {
            SubmitOutcome::Accepted => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                metrics::record_queue_depth(self.receiver.len());
            }
            SubmitOutcome::Dropped => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            SubmitOutcome::Closed => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            }
            SubmitOutcome::Cancelled => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    fn send_blocking(
        &self,
        sender: &Sender<DetectionJob>,
        mut job: DetectionJob,
        running: Option<&AtomicBool>,
    ) -> SubmitOutcome {
        loop {
            match sender.send_timeout(job, BLOCK_POLL) {
                Ok(()) => return SubmitOutcome::Accepted,
                Err(SendTimeoutError::Timeout(pending)) => {
                    if !self.is_accepting() {
                        return SubmitOutcome::Closed;
                    }
                    if running.is_some_and(|r| !r.load(Ordering::Acquire)) {
                        debug!(
                            stream_id = %pending.stream_id(),
                            sequence = pending.sequence(),
                            "Submitter stopped while waiting for queue space"
                        );
                        return SubmitOutcome::Cancelled;
                    }
                    job = pending;
                }
                Err(SendTimeoutError::Disconnected(_)) => return SubmitOutcome::Closed,
            }
        }
    }

    fn reject(&self) -> SubmitOutcome {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        SubmitOutcome::Closed
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            queue_depth: self.receiver.len(),
            workers: self.worker_count,
        }
    }

    /// Stop accepting, let workers drain the queue for up to `grace`, then
    /// discard whatever is still queued. Inference already running is not
    /// interrupted; workers stuck in it past a short extra wait are detached
    /// instead of joined, so this never blocks much longer than `grace`.
    /// Safe to call more than once.
    pub fn shutdown(&self, grace: Duration) -> PoolStats {
        self.accepting.store(false, Ordering::Release);

        match self.sender.write() {
            Ok(mut guard) => drop(guard.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }

        let workers: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        if workers.is_empty() {
            return self.stats();
        }

        info!(
            queued = self.receiver.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down detection worker pool"
        );

        let deadline = Instant::now() + grace;
        while !workers.iter().all(JoinHandle::is_finished) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        if !workers.iter().all(JoinHandle::is_finished) {
            warn!(
                remaining = self.receiver.len(),
                "Grace period elapsed, discarding queued jobs"
            );
            self.discard.store(true, Ordering::Release);
            self.discard_queued();

            // Workers still inside inference get a short last chance
            let deadline = Instant::now() + DETACH_WAIT;
            while !workers.iter().all(JoinHandle::is_finished) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
        }

        let (finished, stuck): (Vec<_>, Vec<_>) =
            workers.into_iter().partition(JoinHandle::is_finished);
        for handle in finished {
            let _ = handle.join();
        }
        if !stuck.is_empty() {
            warn!(
                stuck_workers = stuck.len(),
                "Workers still busy in inference, detaching them"
            );
        }

        let stats = self.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            discarded = stats.discarded,
            dropped = stats.dropped,
            "Detection worker pool stopped"
        );
        stats
    }

    /// Complete every job still in the queue as `Discarded`.
    fn discard_queued(&self) {
        while let Ok(job) = self.receiver.try_recv() {
            discard_job(&self.counters, job);
        }
    }
}

impl Drop for DetectionWorkerPool {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

fn load_models(
    models: &[ModelConfig],
    backend: &dyn DetectorBackend,
) -> PipelineResult<Arc<[Arc<dyn Detector>]>> {
    models
        .iter()
        .map(|model| {
            backend.load(model).map_err(|e| {
                PipelineError::setup(format!("failed to load model {}: {}", model.name, e))
            })
        })
        .collect::<PipelineResult<Vec<_>>>()
        .map(Arc::from)
}

struct Worker {
    index: usize,
    receiver: Receiver<DetectionJob>,
    detectors: Arc<[Arc<dyn Detector>]>,
    counters: Arc<Counters>,
    discard: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        debug!(worker = self.index, "Worker started");

        while let Ok(job) = self.receiver.recv() {
            if self.discard.load(Ordering::Acquire) {
                discard_job(&self.counters, job);
                continue;
            }

            let DetectionJob {
                frame,
                model,
                filter,
                on_complete,
            } = job;
            let stream_id = frame.stream_id.clone();
            let sequence = frame.sequence;

            let outcome = match self.detectors.get(model) {
                None => JobOutcome::Failed {
                    stream_id,
                    sequence,
                    error: format!("unknown model index {}", model),
                },
                Some(detector) => {
                    let started = Instant::now();
                    let inferred =
                        panic::catch_unwind(AssertUnwindSafe(|| detector.infer(&frame)));
                    metrics::record_inference(detector.name(), started.elapsed());

                    match inferred {
                        Ok(Ok(raw)) => JobOutcome::Completed(DetectionResult {
                            stream_id,
                            sequence,
                            timestamp: frame.timestamp,
                            model: detector.name().to_string(),
                            detections: filter.apply(raw),
                        }),
                        Ok(Err(e)) => JobOutcome::Failed {
                            stream_id,
                            sequence,
                            error: e.to_string(),
                        },
                        Err(payload) => JobOutcome::Failed {
                            stream_id,
                            sequence,
                            error: format!("inference panicked: {}", panic_message(&*payload)),
                        },
                    }
                }
            };

            if let JobOutcome::Failed {
                stream_id,
                sequence,
                error,
            } = &outcome
            {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_job("failed");
                warn!(
                    worker = self.index,
                    stream_id = %stream_id,
                    sequence,
                    "Detection failed: {}",
                    error
                );
            } else {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                metrics::record_job("completed");
            }

            // The frame is released here, before the result is handed on
            drop(frame);
            self.complete(on_complete, outcome);
        }

        debug!(worker = self.index, "Worker exiting");
    }

    fn complete(&self, callback: crate::job::JobCallback, outcome: JobOutcome) {
        if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
            warn!(worker = self.index, "Job completion callback panicked");
        }
    }
}

fn discard_job(counters: &Counters, job: DetectionJob) {
    counters.discarded.fetch_add(1, Ordering::Relaxed);
    metrics::record_job("discarded");
    let outcome = JobOutcome::Discarded {
        stream_id: job.frame.stream_id.clone(),
        sequence: job.frame.sequence,
    };
    let callback = job.on_complete;
    if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
        warn!("Job completion callback panicked");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One-time, guarded holder for the shared pool.
///
/// The first caller of [`PoolCell::get_or_try_init`] runs the initializer
/// while holding the guard; concurrent callers block on the guard and then
/// observe the published pool. A failed initialization publishes nothing, so
/// a later call retries.
pub struct PoolCell {
    guard: Mutex<()>,
    pool: OnceLock<Arc<DetectionWorkerPool>>,
}

static GLOBAL_POOL: OnceLock<Arc<PoolCell>> = OnceLock::new();

impl PoolCell {
    pub const fn new() -> Self {
        Self {
            guard: Mutex::new(()),
            pool: OnceLock::new(),
        }
    }

    /// Process-wide cell.
    pub fn global() -> Arc<PoolCell> {
        Arc::clone(GLOBAL_POOL.get_or_init(|| Arc::new(PoolCell::new())))
    }

    pub fn get(&self) -> Option<Arc<DetectionWorkerPool>> {
        self.pool.get().cloned()
    }

    pub fn get_or_try_init<F>(&self, init: F) -> PipelineResult<Arc<DetectionWorkerPool>>
    where
        F: FnOnce() -> PipelineResult<DetectionWorkerPool>,
    {
        if let Some(pool) = self.pool.get() {
            return Ok(Arc::clone(pool));
        }

        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = self.pool.get() {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(init()?);
        // Only the guard holder sets the cell, so this cannot already be set
        let _ = self.pool.set(Arc::clone(&pool));
        Ok(pool)
    }
}

impl Default for PoolCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use vdet_media::{MediaError, MediaResult, RegionClassFilter};
    use vdet_models::{BoundingBox, Detection, Frame, PixelFormat};

    struct FixedDetector {
        name: String,
    }

    impl Detector for FixedDetector {
        fn infer(&self, frame: &Frame) -> MediaResult<Vec<Detection>> {
            match frame.sequence {
                13 => Err(MediaError::detection_failed("bad frame")),
                666 => panic!("detector exploded"),
                _ => Ok(vec![Detection {
                    label: "person".to_string(),
                    class_id: 0,
                    confidence: 0.9,
                    bbox: BoundingBox::new(0.1, 0.1, 0.2, 0.2),
                }]),
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    struct CountingBackend {
        loads: AtomicUsize,
        shared: bool,
        fail: bool,
    }

    impl CountingBackend {
        fn new(shared: bool) -> Self {
            Self {
                loads: AtomicUsize::new(0),
                shared,
                fail: false,
            }
        }
    }

    impl DetectorBackend for CountingBackend {
        fn load(&self, model: &ModelConfig) -> MediaResult<Arc<dyn Detector>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MediaError::model_not_found(&model.path));
            }
            Ok(Arc::new(FixedDetector {
                name: model.name.clone(),
            }))
        }

        fn supports_shared_inference(&self) -> bool {
            self.shared
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn pool_config(workers: usize, capacity: usize) -> PoolConfig {
        PoolConfig {
            worker_threads: workers,
            queue_capacity: capacity,
            ..PoolConfig::default()
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame {
            stream_id: "cam-1".to_string(),
            sequence,
            timestamp: Utc::now(),
            width: 1,
            height: 1,
            format: PixelFormat::Rgb24,
            data: vec![0; 3],
        }
    }

    fn run_job(pool: &DetectionWorkerPool, sequence: u64) -> JobOutcome {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let job = DetectionJob::new(
            frame(sequence),
            0,
            Arc::new(RegionClassFilter::pass_all()),
            move |outcome| {
                let _ = tx.send(outcome);
            },
        );
        assert_eq!(pool.submit(job), SubmitOutcome::Accepted);
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_loads_once_per_worker_without_shared_inference() {
        let backend = CountingBackend::new(false);
        let models = vec![ModelConfig::new("yolo", "a.onnx"), ModelConfig::new("det2", "b.onnx")];
        let pool = DetectionWorkerPool::initialize(&models, &pool_config(3, 4), &backend).unwrap();

        assert_eq!(backend.loads.load(Ordering::SeqCst), 6);
        assert_eq!(pool.model_index("det2"), Some(1));
        assert_eq!(pool.stats().workers, 3);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_shared_backend_loads_each_model_once() {
        let backend = CountingBackend::new(true);
        let models = vec![ModelConfig::new("yolo", "a.onnx")];
        let pool = DetectionWorkerPool::initialize(&models, &pool_config(4, 4), &backend).unwrap();

        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_model_load_failure_is_setup_error() {
        let mut backend = CountingBackend::new(true);
        backend.fail = true;
        let models = vec![ModelConfig::new("yolo", "missing.onnx")];

        match DetectionWorkerPool::initialize(&models, &pool_config(2, 4), &backend) {
            Err(PipelineError::Setup(msg)) => assert!(msg.contains("yolo")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("initialization must fail"),
        }
    }

    #[test]
    fn test_failures_and_panics_are_contained() {
        let backend = CountingBackend::new(true);
        let models = vec![ModelConfig::new("yolo", "a.onnx")];
        let pool = DetectionWorkerPool::initialize(&models, &pool_config(1, 4), &backend).unwrap();

        assert!(matches!(run_job(&pool, 13), JobOutcome::Failed { sequence: 13, .. }));
        match run_job(&pool, 666) {
            JobOutcome::Failed { error, .. } => assert!(error.contains("detector exploded")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        // The single worker is still serving jobs
        match run_job(&pool, 1) {
            JobOutcome::Completed(result) => {
                assert_eq!(result.model, "yolo");
                assert_eq!(result.detections.len(), 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let stats = pool.shutdown(Duration::from_secs(1));
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_submit_after_shutdown_is_closed() {
        let backend = CountingBackend::new(true);
        let models = vec![ModelConfig::new("yolo", "a.onnx")];
        let pool = DetectionWorkerPool::initialize(&models, &pool_config(1, 4), &backend).unwrap();
        pool.shutdown(Duration::from_millis(100));

        let job = DetectionJob::new(frame(0), 0, Arc::new(RegionClassFilter::pass_all()), |_| {});
        assert_eq!(pool.submit(job), SubmitOutcome::Closed);
        assert_eq!(pool.stats().rejected, 1);
        // Second shutdown is a no-op
        pool.shutdown(Duration::from_millis(100));
    }

    #[test]
    fn test_pool_cell_retries_after_failed_init() {
        let cell = PoolCell::new();
        let result = cell.get_or_try_init(|| Err(PipelineError::setup("first attempt fails")));
        assert!(result.is_err());
        assert!(cell.get().is_none());

        let backend = CountingBackend::new(true);
        let models = vec![ModelConfig::new("yolo", "a.onnx")];
        let pool = cell
            .get_or_try_init(|| DetectionWorkerPool::initialize(&models, &pool_config(1, 1), &backend))
            .unwrap();
        assert!(Arc::ptr_eq(&pool, &cell.get().unwrap()));
        pool.shutdown(Duration::from_millis(100));
    }
}
