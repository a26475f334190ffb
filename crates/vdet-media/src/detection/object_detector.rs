//! YOLOv8 object detection through ONNX Runtime.
//!
//! Execution provider selection:
//! - CUDA on Linux with NVIDIA GPU (when the `cuda` feature is enabled)
//! - CoreML on macOS
//! - CPU fallback on all platforms

use std::path::Path;
use std::sync::Mutex;

use image::{DynamicImage, ImageBuffer, Rgb};
use ndarray::ArrayView2;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use tracing::{debug, info};
use vdet_models::{BoundingBox, Detection, Frame, ModelConfig, PixelFormat};

use super::Detector;
use crate::error::{MediaError, MediaResult};

/// COCO class names (80 classes).
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck",
    "boat", "traffic light", "fire hydrant", "stop sign", "parking meter", "bench",
    "bird", "cat", "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra",
    "giraffe", "backpack", "umbrella", "handbag", "tie", "suitcase", "frisbee",
    "skis", "snowboard", "sports ball", "kite", "baseball bat", "baseball glove",
    "skateboard", "surfboard", "tennis racket", "bottle", "wine glass", "cup",
    "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
    "refrigerator", "book", "clock", "vase", "scissors", "teddy bear", "hair drier",
    "toothbrush",
];

/// Box coordinates plus one score per class.
const BOX_FEATURES: usize = 4;

/// YOLOv8 detector backed by one ONNX Runtime session.
pub struct ObjectDetector {
    session: Mutex<Session>,
    config: ModelConfig,
    labels: Vec<String>,
}

impl ObjectDetector {
    /// Load the model named by `config`.
    pub fn new(config: ModelConfig) -> MediaResult<Self> {
        let model_path = Path::new(&config.path);
        if !model_path.exists() {
            return Err(MediaError::model_not_found(&config.path));
        }

        let session = Mutex::new(create_session(model_path)?);
        let labels = if config.labels.is_empty() {
            COCO_CLASSES.iter().map(|s| s.to_string()).collect()
        } else {
            config.labels.clone()
        };

        info!(
            model = %config.name,
            model_path = %config.path,
            input_size = config.input_size,
            "Object detector initialized"
        );

        Ok(Self {
            session,
            config,
            labels,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Preprocess for YOLOv8: resize to the square input, scale to [0, 1], NCHW.
    fn preprocess(&self, img: &DynamicImage) -> MediaResult<Value> {
        let input_size = self.config.input_size;
        let resized = img
            .resize_exact(input_size, input_size, image::imageops::FilterType::Triangle)
            .to_rgb8();

        let (w, h) = (input_size as usize, input_size as usize);
        let mut chw_data: Vec<f32> = vec![0.0; 3 * h * w];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let offset = y as usize * w + x as usize;
            for c in 0..3 {
                chw_data[c * h * w + offset] = pixel[c] as f32 / 255.0;
            }
        }

        let shape = vec![1usize, 3, h, w];
        Tensor::from_array((shape, chw_data.into_boxed_slice()))
            .map(Value::from)
            .map_err(|e| MediaError::detection_failed(format!("Failed to create tensor: {}", e)))
    }

    /// Run the session, returning the output shape and data.
    fn run_inference(&self, input: Value) -> MediaResult<(Vec<usize>, Vec<f32>)> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| MediaError::internal("Session lock poisoned"))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| MediaError::detection_failed(format!("ONNX inference failed: {}", e)))?;

        let output = outputs
            .get("output0")
            .ok_or_else(|| MediaError::detection_failed("Missing output0 tensor"))?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| MediaError::detection_failed(format!("Failed to extract tensor: {}", e)))?;

        let dims = shape.iter().map(|&d| d.max(0) as usize).collect();
        Ok((dims, data.to_vec()))
    }

    fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

impl Detector for ObjectDetector {
    fn infer(&self, frame: &Frame) -> MediaResult<Vec<Detection>> {
        let img = frame_to_image(frame)?;
        let input = self.preprocess(&img)?;
        let (shape, output) = self.run_inference(input)?;

        let candidates = decode_output(&output, &shape, &self.config)?;
        let detections: Vec<Detection> = non_maximum_suppression(candidates, self.config.nms_threshold)
            .into_iter()
            .map(|c| Detection {
                label: self.label_for(c.class_id),
                class_id: c.class_id,
                confidence: c.confidence,
                bbox: c.bbox,
            })
            .collect();

        debug!(
            stream_id = %frame.stream_id,
            sequence = frame.sequence,
            model = %self.config.name,
            count = detections.len(),
            "Object detection completed"
        );

        Ok(detections)
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    class_id: usize,
    confidence: f32,
    bbox: BoundingBox,
}

fn frame_to_image(frame: &Frame) -> MediaResult<DynamicImage> {
    if !frame.is_consistent() {
        return Err(MediaError::InvalidFrame(format!(
            "expected {} bytes for {}x{}, got {}",
            Frame::expected_len(frame.width, frame.height, frame.format),
            frame.width,
            frame.height,
            frame.data.len()
        )));
    }

    match frame.format {
        PixelFormat::Rgb24 => {
            let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
                ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())
                    .ok_or_else(|| MediaError::internal("Failed to create image buffer"))?;
            Ok(DynamicImage::ImageRgb8(buffer))
        }
    }
}

/// Decode a `[1, 4 + classes, boxes]` YOLOv8 output into thresholded
/// candidates with normalized boxes.
///
/// The model sees the frame stretched to a square input, so dividing by the
/// input size normalizes directly.
fn decode_output(output: &[f32], shape: &[usize], config: &ModelConfig) -> MediaResult<Vec<Candidate>> {
    let (num_features, num_boxes) = match shape {
        [1, features, boxes] => (*features, *boxes),
        [features, boxes] => (*features, *boxes),
        _ => {
            return Err(MediaError::detection_failed(format!(
                "Unexpected output shape {:?}",
                shape
            )))
        }
    };

    if num_features <= BOX_FEATURES {
        return Err(MediaError::detection_failed(format!(
            "Output has no class scores: {:?}",
            shape
        )));
    }

    let rows = ArrayView2::from_shape((num_features, num_boxes), output)
        .map_err(|e| MediaError::detection_failed(format!("Failed to reshape output: {}", e)))?;
    let rows = rows.t();

    let input_size = config.input_size as f32;
    let mut candidates = Vec::new();

    for row in rows.outer_iter() {
        let (best_class, best_score) = row
            .iter()
            .skip(BOX_FEATURES)
            .enumerate()
            .fold((0usize, 0.0f32), |best, (class, &score)| {
                if score > best.1 {
                    (class, score)
                } else {
                    best
                }
            });

        if best_score < config.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let x = ((cx - w / 2.0) / input_size).clamp(0.0, 1.0);
        let y = ((cy - h / 2.0) / input_size).clamp(0.0, 1.0);
        let width = (w / input_size).min(1.0 - x).max(0.0);
        let height = (h / input_size).min(1.0 - y).max(0.0);

        candidates.push(Candidate {
            class_id: best_class,
            confidence: best_score,
            bbox: BoundingBox::new(x, y, width, height),
        });
    }

    Ok(candidates)
}

/// Per-class non-maximum suppression.
fn non_maximum_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let overlaps = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            keep.push(candidate);
        }
    }
    keep
}

/// Create an ONNX Runtime session with automatic execution provider selection.
fn create_session(model_path: &Path) -> MediaResult<Session> {
    let model_bytes = std::fs::read(model_path)
        .map_err(|e| MediaError::model_load(format!("Failed to read model file: {}", e)))?;

    let builder = Session::builder()
        .map_err(|e| MediaError::model_load(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| MediaError::model_load(format!("Failed to set optimization level: {}", e)))?;

    #[cfg(all(target_os = "linux", feature = "cuda"))]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        if let Ok(cuda_builder) = builder
            .clone()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
        {
            if let Ok(session) = cuda_builder.commit_from_memory(&model_bytes) {
                info!("Using CUDA execution provider for object detection");
                return Ok(session);
            }
        }
        debug!("CUDA execution provider not available, trying alternatives");
    }

    #[cfg(target_os = "macos")]
    {
        use ort::execution_providers::CoreMLExecutionProvider;
        if let Ok(coreml_builder) = builder
            .clone()
            .with_execution_providers([CoreMLExecutionProvider::default().build()])
        {
            if let Ok(session) = coreml_builder.commit_from_memory(&model_bytes) {
                info!("Using CoreML execution provider for object detection");
                return Ok(session);
            }
        }
        debug!("CoreML execution provider not available, using CPU");
    }

    info!("Using CPU execution provider for object detection");
    builder
        .commit_from_memory(&model_bytes)
        .map_err(|e| MediaError::model_load(format!("Failed to load ONNX model: {}", e)))
}
