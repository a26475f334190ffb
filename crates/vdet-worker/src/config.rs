//! Worker configuration.
//!
//! The pipeline is described by a JSON file; a handful of scalar knobs can be
//! overridden from the environment without editing it.

use std::net::SocketAddr;
use std::path::Path;

use vdet_models::{ConfigError, PipelineConfig, QueuePolicy};

use crate::error::PipelineResult;

/// Environment variable naming the pipeline file.
pub const PIPELINE_CONFIG_ENV: &str = "VDET_PIPELINE_CONFIG";

/// Everything the worker binary needs to run.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pipeline: PipelineConfig,
    /// Address for the Prometheus scrape endpoint, if enabled
    pub metrics_addr: Option<SocketAddr>,
}

impl WorkerConfig {
    /// Load the pipeline file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Same as [`WorkerConfig::load`] with an explicit variable lookup.
    pub fn load_with<F>(path: impl AsRef<Path>, lookup: F) -> PipelineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        let mut pipeline = PipelineConfig::from_json_str(&raw)?;
        apply_overrides(&mut pipeline, &lookup)?;
        pipeline.validate()?;

        let metrics_addr = match lookup("VDET_METRICS_ADDR").filter(|s| !s.is_empty()) {
            Some(addr) => Some(addr.parse().map_err(|_| {
                ConfigError::invalid_value("VDET_METRICS_ADDR", format!("not a socket address: {}", addr))
            })?),
            None => None,
        };

        Ok(Self {
            pipeline,
            metrics_addr,
        })
    }
}

/// Apply `VDET_*` overrides onto a parsed pipeline configuration.
pub fn apply_overrides<F>(config: &mut PipelineConfig, lookup: F) -> PipelineResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(threads) = parse_var(&lookup, "VDET_WORKER_THREADS")? {
        config.pool.worker_threads = threads;
    }
    if let Some(capacity) = parse_var(&lookup, "VDET_QUEUE_CAPACITY")? {
        config.pool.queue_capacity = capacity;
    }
    if let Some(policy) = parse_var::<QueuePolicy, _>(&lookup, "VDET_QUEUE_POLICY")? {
        config.pool.queue_policy = policy;
    }
    if let Some(url) = lookup("VDET_WEBHOOK_URL").filter(|s| !s.is_empty()) {
        config.webhook.url = url;
    }
    if let Some(retries) = parse_var(&lookup, "VDET_WEBHOOK_MAX_RETRIES")? {
        config.webhook.max_retries = retries;
    }
    if let Some(grace) = parse_var(&lookup, "VDET_STOP_GRACE_MS")? {
        config.session.stop_grace_ms = grace;
    }
    if let Some(window) = parse_var(&lookup, "VDET_REORDER_WINDOW")? {
        config.session.reorder_window = window;
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> PipelineResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid_value(key, format!("cannot parse {:?}", raw)).into()),
        None => Ok(None),
    }
}
