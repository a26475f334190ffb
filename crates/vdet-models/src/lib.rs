//! Shared data models for the VDet detection pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Decoded frames and their capture metadata
//! - Normalized geometry (bounding boxes, region polygons)
//! - Detections, per-frame results and webhook events
//! - Pipeline configuration and validation
//! - Stream session lifecycle states

pub mod config;
pub mod detection;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod session;

// Re-export common types
pub use config::{
    ModelConfig, PipelineConfig, PoolConfig, QueuePolicy, ReconnectConfig, RegionMatch,
    RtspTransport, SessionConfig, StreamConfig, TransportOptions, WebhookConfig,
};
pub use detection::{Detection, DetectionEvent, DetectionResult};
pub use error::{ConfigError, ConfigResult};
pub use frame::{Frame, PixelFormat};
pub use geometry::{BoundingBox, Point, Polygon};
pub use session::{AtomicSessionState, SessionState};
