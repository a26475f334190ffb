//! Detection jobs exchanged between sessions and the worker pool.

use std::fmt;
use std::sync::Arc;

use vdet_media::RegionClassFilter;
use vdet_models::{DetectionResult, Frame};

/// Called exactly once by the worker that took the job.
pub type JobCallback = Box<dyn FnOnce(JobOutcome) + Send + 'static>;

/// One frame to run through one model.
///
/// The job owns its frame; only the worker that dequeues it ever sees it.
pub struct DetectionJob {
    pub frame: Frame,
    /// Index of the model in pool load order
    pub model: usize,
    pub filter: Arc<RegionClassFilter>,
    pub on_complete: JobCallback,
}

impl DetectionJob {
    pub fn new(
        frame: Frame,
        model: usize,
        filter: Arc<RegionClassFilter>,
        on_complete: impl FnOnce(JobOutcome) + Send + 'static,
    ) -> Self {
        Self {
            frame,
            model,
            filter,
            on_complete: Box::new(on_complete),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.frame.stream_id
    }

    pub fn sequence(&self) -> u64 {
        self.frame.sequence
    }
}

impl fmt::Debug for DetectionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionJob")
            .field("frame", &self.frame)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// What happened to an accepted job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Inference ran; detections are already filtered
    Completed(DetectionResult),
    /// Inference failed or panicked
    Failed {
        stream_id: String,
        sequence: u64,
        error: String,
    },
    /// Dropped unprocessed during pool shutdown
    Discarded { stream_id: String, sequence: u64 },
}

impl JobOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            JobOutcome::Completed(result) => result.sequence,
            JobOutcome::Failed { sequence, .. } | JobOutcome::Discarded { sequence, .. } => *sequence,
        }
    }
}

/// Result of offering a job to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Queue full under the drop policy
    Dropped,
    /// Pool is shutting down
    Closed,
    /// The submitter's own stop flag cleared while it waited for space
    Cancelled,
}
