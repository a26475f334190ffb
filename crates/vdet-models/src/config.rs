//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is built once at process start, validated, and then
//! shared read-only by every stream session.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, ConfigResult};
use crate::geometry::Polygon;

/// Complete, immutable pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Detection models loaded into the shared pool
    pub models: Vec<ModelConfig>,
    /// Streams to start at process launch
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    pub webhook: WebhookConfig,
    /// Default transport options for streams that don't override them
    #[serde(default)]
    pub transport: TransportOptions,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub region_match: RegionMatch,
}

impl PipelineConfig {
    /// Parse from a JSON document (no validation).
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Look up a model by name.
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Index of a model in load order.
    pub fn model_index(&self, name: &str) -> Option<usize> {
        self.models.iter().position(|m| m.name == name)
    }

    /// Look up a configured stream by id.
    pub fn stream(&self, id: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.id == id)
    }

    /// Transport options for a stream (stream override or pipeline default).
    pub fn transport_for(&self, stream: &StreamConfig) -> TransportOptions {
        stream.transport.clone().unwrap_or_else(|| self.transport.clone())
    }

    /// Class allow-list for a stream: stream override, else the model's list.
    ///
    /// An empty list means "all classes".
    pub fn classes_for(&self, stream: &StreamConfig) -> Vec<String> {
        if let Some(classes) = &stream.classes {
            return classes.clone();
        }
        self.model(&stream.model)
            .map(|m| m.classes.clone())
            .unwrap_or_default()
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }

        let mut names = HashSet::new();
        for model in &self.models {
            model.validate()?;
            if !names.insert(model.name.as_str()) {
                return Err(ConfigError::DuplicateModel(model.name.clone()));
            }
        }

        let mut ids = HashSet::new();
        for stream in &self.streams {
            self.validate_stream(stream)?;
            if !ids.insert(stream.id.as_str()) {
                return Err(ConfigError::DuplicateStream(stream.id.clone()));
            }
        }

        self.pool.validate()?;
        self.webhook.validate()?;
        self.transport.validate()?;
        self.session.validate()?;
        self.region_match.validate()?;

        Ok(())
    }

    /// Validate one stream against this pipeline (models must exist).
    pub fn validate_stream(&self, stream: &StreamConfig) -> ConfigResult<()> {
        stream.validate()?;
        if self.model(&stream.model).is_none() {
            return Err(ConfigError::UnknownModel {
                stream: stream.id.clone(),
                model: stream.model.clone(),
            });
        }
        Ok(())
    }
}

/// One detection model artifact and its class configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Unique model name
    pub name: String,
    /// Path to the model artifact
    pub path: String,
    /// Class allow-list (empty = all classes)
    #[serde(default)]
    pub classes: Vec<String>,
    /// Class labels by index (empty = COCO labels)
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
    /// Square model input size in pixels
    #[serde(default = "default_input_size")]
    pub input_size: u32,
}

fn default_confidence_threshold() -> f32 {
    0.25
}

fn default_nms_threshold() -> f32 {
    0.45
}

fn default_input_size() -> u32 {
    640
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            classes: Vec::new(),
            labels: Vec::new(),
            confidence_threshold: default_confidence_threshold(),
            nms_threshold: default_nms_threshold(),
            input_size: default_input_size(),
        }
    }

    pub fn with_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.classes = classes.into_iter().map(Into::into).collect();
        self
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid_value("models.name", "must not be empty"));
        }
        if self.path.is_empty() {
            return Err(ConfigError::invalid_value(
                format!("models.{}.path", self.name),
                "must not be empty",
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::invalid_value(
                format!("models.{}.confidence_threshold", self.name),
                "must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.nms_threshold) {
            return Err(ConfigError::invalid_value(
                format!("models.{}.nms_threshold", self.name),
                "must be within [0, 1]",
            ));
        }
        if self.input_size == 0 {
            return Err(ConfigError::invalid_value(
                format!("models.{}.input_size", self.name),
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Per-stream configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Unique stream identifier
    pub id: String,
    /// Source URL (rtsp://, rtmp://, http://, file path, ...)
    pub url: String,
    /// Model used for this stream's frames
    pub model: String,
    /// Regions of interest (empty = whole frame)
    #[serde(default)]
    pub regions: Vec<Polygon>,
    /// Class allow-list override (None = the model's list)
    #[serde(default)]
    pub classes: Option<Vec<String>>,
    /// Transport override (None = pipeline default)
    #[serde(default)]
    pub transport: Option<TransportOptions>,
}

impl StreamConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            model: model.into(),
            regions: Vec::new(),
            classes: None,
            transport: None,
        }
    }

    pub fn with_regions(mut self, regions: Vec<Polygon>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.classes = Some(classes.into_iter().map(Into::into).collect());
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.id.is_empty() {
            return Err(ConfigError::invalid_value("streams.id", "must not be empty"));
        }
        if self.url.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                format!("streams.{}.url", self.id),
                "must not be empty",
            ));
        }
        for (i, region) in self.regions.iter().enumerate() {
            if let Some(reason) = region.validation_error() {
                return Err(ConfigError::invalid_region(
                    &self.id,
                    format!("region {}: {}", i, reason),
                ));
            }
        }
        if let Some(transport) = &self.transport {
            transport.validate()?;
        }
        Ok(())
    }
}

/// What to do with a new job when the detection queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Reject the incoming job and count it as dropped
    #[default]
    DropNewest,
    /// Block the producer until space frees up
    Block,
}

impl std::str::FromStr for QueuePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drop_newest" | "drop-newest" | "drop" => Ok(QueuePolicy::DropNewest),
            "block" => Ok(QueuePolicy::Block),
            other => Err(ConfigError::invalid_value(
                "queue_policy",
                format!("unknown policy {:?}", other),
            )),
        }
    }
}

/// Shared detection worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads
    pub worker_threads: usize,
    /// Bounded job queue capacity
    pub queue_capacity: usize,
    pub queue_policy: QueuePolicy,
    /// How long process shutdown waits for queued jobs to drain
    pub shutdown_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_capacity: 32,
            queue_policy: QueuePolicy::DropNewest,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.worker_threads == 0 {
            return Err(ConfigError::invalid_value(
                "pool.worker_threads",
                "must be at least 1",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "pool.queue_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Webhook delivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Endpoint receiving one POST per qualifying event
    pub url: String,
    /// Retry attempts after the first, for transient transport failures
    #[serde(default = "default_webhook_retries")]
    pub max_retries: u32,
    #[serde(default = "default_webhook_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_webhook_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-request timeout
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_webhook_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Pending event queue capacity
    #[serde(default = "default_webhook_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_webhook_retries() -> u32 {
    3
}

fn default_webhook_base_delay_ms() -> u64 {
    200
}

fn default_webhook_max_delay_ms() -> u64 {
    5_000
}

fn default_webhook_timeout_ms() -> u64 {
    5_000
}

fn default_webhook_connect_timeout_ms() -> u64 {
    2_000
}

fn default_webhook_queue_capacity() -> usize {
    256
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_retries: default_webhook_retries(),
            base_delay_ms: default_webhook_base_delay_ms(),
            max_delay_ms: default_webhook_max_delay_ms(),
            timeout_ms: default_webhook_timeout_ms(),
            connect_timeout_ms: default_webhook_connect_timeout_ms(),
            queue_capacity: default_webhook_queue_capacity(),
        }
    }

    /// Parse and check the endpoint URL.
    pub fn endpoint(&self) -> ConfigResult<Url> {
        let url = Url::parse(&self.url).map_err(|e| ConfigError::InvalidEndpoint {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(ConfigError::InvalidEndpoint {
                url: self.url.clone(),
                reason: format!("unsupported scheme {}", scheme),
            }),
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        self.endpoint()?;
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "webhook.queue_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// RTSP lower transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RtspTransport {
    #[default]
    Tcp,
    Udp,
}

impl RtspTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        }
    }
}

/// Reliability options for the upstream media transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    pub transport: RtspTransport,
    /// Socket stall timeout; also the open deadline
    pub stall_timeout_ms: u64,
    /// Maximum demuxer inter-packet delay
    pub max_delay_ms: u64,
    /// Regenerate presentation timestamps when the source omits them
    pub regenerate_timestamps: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            transport: RtspTransport::Tcp,
            stall_timeout_ms: 5_000,
            max_delay_ms: 500,
            regenerate_timestamps: true,
        }
    }
}

impl TransportOptions {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.stall_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "transport.stall_timeout_ms",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Bounded exponential backoff for source reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect attempts before the source is declared unavailable
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

/// Per-session behavior shared by all streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Decoded frame width handed to the detector
    pub frame_width: u32,
    /// Decoded frame height handed to the detector
    pub frame_height: u32,
    /// Out-of-order results held back per stream before gaps are skipped
    pub reorder_window: usize,
    /// Upper bound on how long stop() waits for the pull thread
    pub stop_grace_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_width: 640,
            frame_height: 360,
            reorder_window: 8,
            stop_grace_ms: 2_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(ConfigError::invalid_value(
                "session.frame_width/frame_height",
                "must be positive",
            ));
        }
        if self.reorder_window == 0 {
            return Err(ConfigError::invalid_value(
                "session.reorder_window",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// How a detection is matched against region polygons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RegionMatch {
    /// The box centroid must fall inside a region
    #[default]
    Centroid,
    /// At least `min_fraction` of the box must overlap the regions
    Overlap { min_fraction: f32 },
}

impl RegionMatch {
    fn validate(&self) -> ConfigResult<()> {
        if let RegionMatch::Overlap { min_fraction } = self {
            if !(*min_fraction > 0.0 && *min_fraction <= 1.0) {
                return Err(ConfigError::invalid_value(
                    "region_match.min_fraction",
                    "must be within (0, 1]",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "models": [
                { "name": "yolo", "path": "models/yolov8n.onnx", "classes": ["person", "car"] }
            ],
            "streams": [
                {
                    "id": "gate",
                    "url": "rtsp://10.0.0.5/stream1",
                    "model": "yolo",
                    "regions": [[{"x":0.0,"y":0.0},{"x":0.5,"y":0.0},{"x":0.5,"y":1.0}]]
                }
            ],
            "webhook": { "url": "http://hooks.local/detections" }
        }"#
    }

    #[test]
    fn test_parse_applies_defaults() {
        let config = PipelineConfig::from_json_str(sample_json()).unwrap();
        assert_eq!(config.pool.worker_threads, 4);
        assert_eq!(config.pool.queue_policy, QueuePolicy::DropNewest);
        assert_eq!(config.transport.transport, RtspTransport::Tcp);
        assert_eq!(config.transport.stall_timeout_ms, 5_000);
        assert_eq!(config.transport.max_delay_ms, 500);
        assert!(config.transport.regenerate_timestamps);
        assert_eq!(config.webhook.max_retries, 3);
        assert_eq!(config.region_match, RegionMatch::Centroid);
        assert_eq!(config.models[0].input_size, 640);
        config.validate().unwrap();
    }

    #[test]
    fn test_classes_for_prefers_stream_override() {
        let mut config = PipelineConfig::from_json_str(sample_json()).unwrap();
        let stream = config.streams[0].clone();
        assert_eq!(config.classes_for(&stream), vec!["person", "car"]);

        config.streams[0].classes = Some(vec!["person".to_string()]);
        let stream = config.streams[0].clone();
        assert_eq!(config.classes_for(&stream), vec!["person"]);
    }

    #[test]
    fn test_unknown_model_rejected() {
        let mut config = PipelineConfig::from_json_str(sample_json()).unwrap();
        config.streams[0].model = "missing".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownModel { .. })
        ));
    }

    #[test]
    fn test_bad_endpoint_rejected() {
        let mut config = PipelineConfig::from_json_str(sample_json()).unwrap();
        config.webhook.url = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));

        config.webhook.url = "ftp://hooks.local/x".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_degenerate_region_rejected() {
        let mut config = PipelineConfig::from_json_str(sample_json()).unwrap();
        config.streams[0].regions = vec![Polygon::from_pairs(&[(0.0, 0.0), (1.0, 1.0)])];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn test_duplicate_stream_rejected() {
        let mut config = PipelineConfig::from_json_str(sample_json()).unwrap();
        let dup = config.streams[0].clone();
        config.streams.push(dup);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateStream(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = PipelineConfig::from_json_str(sample_json()).unwrap();
        config.pool.worker_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_policy_from_str() {
        assert_eq!("block".parse::<QueuePolicy>().unwrap(), QueuePolicy::Block);
        assert_eq!(
            "drop_newest".parse::<QueuePolicy>().unwrap(),
            QueuePolicy::DropNewest
        );
        assert!("fifo".parse::<QueuePolicy>().is_err());
    }

    #[test]
    fn test_region_match_serde() {
        let json = r#"{"mode":"overlap","min_fraction":0.5}"#;
        let parsed: RegionMatch = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, RegionMatch::Overlap { min_fraction: 0.5 });
    }
}
