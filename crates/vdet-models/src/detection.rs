//! Detection results and webhook events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::BoundingBox;

/// A single labeled, scored bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class label (e.g. "person")
    pub label: String,
    /// Model class index
    pub class_id: usize,
    /// Detection confidence [0, 1]
    pub confidence: f32,
    /// Box in normalized frame coordinates
    pub bbox: BoundingBox,
}

/// Detections produced for one frame of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub stream_id: String,
    pub sequence: u64,
    /// Capture timestamp of the source frame
    pub timestamp: DateTime<Utc>,
    /// Name of the model that produced the detections
    pub model: String,
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    /// A result qualifies for delivery when anything survived filtering.
    pub fn is_qualifying(&self) -> bool {
        !self.detections.is_empty()
    }

    /// Convert into a webhook event with a fresh event id.
    pub fn into_event(self) -> DetectionEvent {
        DetectionEvent {
            event_id: Uuid::new_v4(),
            stream_id: self.stream_id,
            sequence: self.sequence,
            timestamp: self.timestamp,
            model: self.model,
            detections: self.detections,
        }
    }
}

/// Payload posted to the webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub event_id: Uuid,
    pub stream_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub detections: Vec<Detection>,
}
