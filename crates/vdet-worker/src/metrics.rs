//! Pipeline metrics.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

pub mod names {
    /// Frames read from sources, by stream.
    pub const FRAMES_PULLED_TOTAL: &str = "vdet_frames_pulled_total";

    /// Frames rejected at submission (queue full or pool closed), by stream.
    pub const FRAMES_DROPPED_TOTAL: &str = "vdet_frames_dropped_total";

    /// Finished jobs by outcome (completed, failed, discarded).
    pub const JOBS_TOTAL: &str = "vdet_jobs_total";

    /// Jobs waiting in the pool queue.
    pub const QUEUE_DEPTH: &str = "vdet_jobs_queue_depth";

    /// Inference latency in seconds, by model.
    pub const INFERENCE_SECONDS: &str = "vdet_inference_seconds";

    /// Results dropped because they arrived after their reorder window.
    pub const RESULTS_LATE_TOTAL: &str = "vdet_results_late_total";

    /// Sessions in the Running state.
    pub const SESSIONS_RUNNING: &str = "vdet_sessions_running";
}

pub fn record_frame_pulled(stream_id: &str) {
    counter!(names::FRAMES_PULLED_TOTAL, "stream_id" => stream_id.to_string()).increment(1);
}

pub fn record_frame_dropped(stream_id: &str) {
    counter!(names::FRAMES_DROPPED_TOTAL, "stream_id" => stream_id.to_string()).increment(1);
}

pub fn record_job(outcome: &'static str) {
    counter!(names::JOBS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_queue_depth(depth: usize) {
    gauge!(names::QUEUE_DEPTH).set(depth as f64);
}

pub fn record_inference(model: &str, elapsed: Duration) {
    histogram!(names::INFERENCE_SECONDS, "model" => model.to_string()).record(elapsed.as_secs_f64());
}

pub fn record_late_result(stream_id: &str) {
    counter!(names::RESULTS_LATE_TOTAL, "stream_id" => stream_id.to_string()).increment(1);
}

pub fn session_running() {
    gauge!(names::SESSIONS_RUNNING).increment(1.0);
}

pub fn session_left_running() {
    gauge!(names::SESSIONS_RUNNING).decrement(1.0);
}
