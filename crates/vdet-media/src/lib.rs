//! Frame ingestion and detection building blocks.
//!
//! This crate provides:
//! - The `FrameSource` abstraction and an FFmpeg-backed implementation
//! - Reconnect handling with bounded exponential backoff
//! - Pluggable detector backends (`DetectorBackend` / `Detector`)
//! - A YOLOv8 ONNX backend
//! - Region-of-interest and class allow-list filtering

pub mod detection;
pub mod error;
pub mod filter;
pub mod source;

pub use detection::{Detector, DetectorBackend, OnnxBackend, ObjectDetector, COCO_CLASSES};
pub use error::{MediaError, MediaResult};
pub use filter::RegionClassFilter;
pub use source::{
    FfmpegSource, FfmpegSourceProvider, FrameSource, ReconnectPolicy, ReconnectingSource,
    SourceOptions, SourceProvider,
};
