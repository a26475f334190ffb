//! Object detection.
//!
//! Detectors are loaded through a [`DetectorBackend`], which also tells the
//! worker pool whether one loaded handle may serve inference from several
//! threads at once. [`OnnxBackend`] runs YOLOv8 models through ONNX Runtime.

mod backend;
mod object_detector;

pub use backend::{Detector, DetectorBackend, OnnxBackend};
pub use object_detector::{ObjectDetector, COCO_CLASSES};
