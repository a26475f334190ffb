//! Test doubles for sources and detectors.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use vdet_media::{
    Detector, DetectorBackend, FrameSource, MediaError, MediaResult, SourceOptions, SourceProvider,
};
use vdet_models::{
    BoundingBox, Detection, Frame, ModelConfig, PipelineConfig, PoolConfig, ReconnectConfig,
    SessionConfig, WebhookConfig,
};

/// Pipeline tuned for fast tests: tiny frames, short backoff, short grace.
pub fn pipeline_config(webhook_url: &str) -> PipelineConfig {
    let mut webhook = WebhookConfig::new(webhook_url);
    webhook.max_retries = 2;
    webhook.base_delay_ms = 5;
    webhook.max_delay_ms = 20;
    webhook.timeout_ms = 1_000;
    webhook.connect_timeout_ms = 500;

    PipelineConfig {
        models: vec![ModelConfig::new("yolo", "models/yolo.onnx")],
        streams: Vec::new(),
        pool: PoolConfig {
            worker_threads: 2,
            queue_capacity: 8,
            shutdown_grace_ms: 1_000,
            ..PoolConfig::default()
        },
        webhook,
        transport: Default::default(),
        session: SessionConfig {
            frame_width: 4,
            frame_height: 4,
            reorder_window: 8,
            stop_grace_ms: 1_000,
            reconnect: ReconnectConfig {
                max_retries: 2,
                base_delay_ms: 5,
                max_delay_ms: 20,
            },
        },
        region_match: Default::default(),
    }
}

pub fn person(x: f32, y: f32) -> Detection {
    Detection {
        label: "person".to_string(),
        class_id: 0,
        confidence: 0.9,
        bbox: BoundingBox::new(x, y, 0.1, 0.1),
    }
}

pub fn car(x: f32, y: f32) -> Detection {
    Detection {
        label: "car".to_string(),
        class_id: 2,
        confidence: 0.8,
        bbox: BoundingBox::new(x, y, 0.1, 0.1),
    }
}

/// Poll `done` every 10 ms for up to `timeout`.
pub fn wait_until(timeout: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

/// Live source emitting a frame every `interval` for as long as it is open.
pub struct LiveSource {
    url: String,
    width: u32,
    height: u32,
    interval: Duration,
    open: bool,
}

impl FrameSource for LiveSource {
    fn open(&mut self) -> MediaResult<()> {
        self.open = true;
        Ok(())
    }

    fn next_frame(&mut self) -> MediaResult<Frame> {
        if !self.open {
            return Err(MediaError::decode("not open"));
        }
        thread::sleep(self.interval);
        Ok(Frame {
            stream_id: String::new(),
            sequence: 0,
            timestamp: Utc::now(),
            width: self.width,
            height: self.height,
            format: vdet_models::PixelFormat::Rgb24,
            data: vec![0; Frame::expected_len(self.width, self.height, vdet_models::PixelFormat::Rgb24)],
        })
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Provides [`LiveSource`]s, or sources that never open when `unreachable`.
pub struct FakeSources {
    pub interval: Duration,
    pub unreachable: bool,
    pub open_attempts: Arc<AtomicUsize>,
}

impl FakeSources {
    pub fn live(interval: Duration) -> Self {
        Self {
            interval,
            unreachable: false,
            open_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            interval: Duration::from_millis(5),
            unreachable: true,
            open_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct UnreachableSource {
    url: String,
    attempts: Arc<AtomicUsize>,
}

impl FrameSource for UnreachableSource {
    fn open(&mut self) -> MediaResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(MediaError::source_unavailable(&self.url, "connection refused"))
    }

    fn next_frame(&mut self) -> MediaResult<Frame> {
        Err(MediaError::source_unavailable(&self.url, "not open"))
    }

    fn close(&mut self) {}

    fn url(&self) -> &str {
        &self.url
    }
}

impl SourceProvider for FakeSources {
    fn create(&self, options: SourceOptions) -> MediaResult<Box<dyn FrameSource>> {
        if self.unreachable {
            return Ok(Box::new(UnreachableSource {
                url: options.url,
                attempts: Arc::clone(&self.open_attempts),
            }));
        }
        Ok(Box::new(LiveSource {
            url: options.url,
            width: options.width,
            height: options.height,
            interval: self.interval,
            open: false,
        }))
    }
}

/// Detector returning the same detections for selected frames.
pub struct ScriptedDetector {
    name: String,
    detections: Vec<Detection>,
    /// Only frames with this sequence produce detections; `None` means all
    only_sequence: Option<u64>,
    calls: Arc<AtomicU64>,
    gate: Option<Arc<AtomicBool>>,
    slow_even: Duration,
}

impl Detector for ScriptedDetector {
    fn infer(&self, frame: &Frame) -> MediaResult<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            while !gate.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(2));
            }
        }
        if !self.slow_even.is_zero() && frame.sequence % 2 == 0 {
            thread::sleep(self.slow_even);
        }
        match self.only_sequence {
            Some(seq) if seq != frame.sequence => Ok(Vec::new()),
            _ => Ok(self.detections.clone()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Backend handing out [`ScriptedDetector`]s and counting loads.
pub struct ScriptedBackend {
    pub detections: Vec<Detection>,
    pub only_sequence: Option<u64>,
    pub loads: Arc<AtomicUsize>,
    pub calls: Arc<AtomicU64>,
    /// Inference blocks while the gate is `false`
    pub gate: Option<Arc<AtomicBool>>,
    pub load_delay: Duration,
    pub shared: bool,
    /// Extra inference time for even sequences, to finish jobs out of order
    pub slow_even: Duration,
}

impl ScriptedBackend {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            only_sequence: None,
            loads: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicU64::new(0)),
            gate: None,
            load_delay: Duration::ZERO,
            shared: true,
            slow_even: Duration::ZERO,
        }
    }

    pub fn only_on(mut self, sequence: u64) -> Self {
        self.only_sequence = Some(sequence);
        self
    }

    pub fn gated(mut self, gate: Arc<AtomicBool>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn slow_on_even(mut self, delay: Duration) -> Self {
        self.slow_even = delay;
        self
    }
}

impl DetectorBackend for ScriptedBackend {
    fn load(&self, model: &ModelConfig) -> MediaResult<Arc<dyn Detector>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            thread::sleep(self.load_delay);
        }
        Ok(Arc::new(ScriptedDetector {
            name: model.name.clone(),
            detections: self.detections.clone(),
            only_sequence: self.only_sequence,
            calls: Arc::clone(&self.calls),
            gate: self.gate.clone(),
            slow_even: self.slow_even,
        }))
    }

    fn supports_shared_inference(&self) -> bool {
        self.shared
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
