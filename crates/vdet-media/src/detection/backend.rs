use std::sync::Arc;

use vdet_models::{Detection, Frame, ModelConfig};

use super::ObjectDetector;
use crate::error::MediaResult;

/// A loaded model able to run inference on a frame.
pub trait Detector: Send + Sync {
    /// Run inference on one frame. Boxes are in normalized frame coordinates.
    fn infer(&self, frame: &Frame) -> MediaResult<Vec<Detection>>;

    /// Name of the model this detector was loaded from.
    fn name(&self) -> &str;
}

/// Loads detectors and reports their threading capability.
pub trait DetectorBackend: Send + Sync {
    fn load(&self, model: &ModelConfig) -> MediaResult<Arc<dyn Detector>>;

    /// Whether one loaded handle may run inference from several threads
    /// concurrently. When false the pool loads a private handle per worker.
    fn supports_shared_inference(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// YOLOv8 models through ONNX Runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxBackend;

impl DetectorBackend for OnnxBackend {
    fn load(&self, model: &ModelConfig) -> MediaResult<Arc<dyn Detector>> {
        Ok(Arc::new(ObjectDetector::new(model.clone())?))
    }

    // Each session runs behind its own lock, so sharing one would serialize workers.
    fn supports_shared_inference(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "onnx"
    }
}
