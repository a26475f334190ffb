//! Real-time detection pipeline.
//!
//! This crate provides:
//! - Stream sessions pulling frames and tracking their lifecycle
//! - A process-wide detection worker pool with a bounded job queue
//! - Per-stream result ordering and webhook hand-off
//! - A runtime owning sessions and coordinated shutdown

pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod reorder;
pub mod runtime;
pub mod session;

pub use config::WorkerConfig;
pub use error::{PipelineError, PipelineResult};
pub use job::{DetectionJob, JobOutcome, SubmitOutcome};
pub use logging::SessionLogger;
pub use pool::{DetectionWorkerPool, PoolCell, PoolStats};
pub use reorder::ReorderBuffer;
pub use runtime::{PipelineRuntime, RuntimeStats, SessionInfo};
pub use session::{SessionContext, SessionFailure, SessionHandle, SessionStats, StreamSession};
