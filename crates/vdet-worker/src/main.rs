//! Detection pipeline worker binary.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};

use vdet_webhook::WebhookDispatcher;
use vdet_worker::config::PIPELINE_CONFIG_ENV;
use vdet_worker::logging::init_tracing;
use vdet_worker::{PipelineError, PipelineRuntime, WorkerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run().await {
        let code = e
            .downcast_ref::<PipelineError>()
            .map(PipelineError::exit_code)
            .unwrap_or(1);
        error!("Worker failed: {:#}", e);
        std::process::exit(code);
    }
}

async fn run() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for HTTPS webhooks)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    info!("Starting vdet-worker");

    let path = std::env::var(PIPELINE_CONFIG_ENV)
        .ok()
        .or_else(|| std::env::args().nth(1))
        .ok_or_else(|| anyhow!("No pipeline configuration: set {} or pass a path", PIPELINE_CONFIG_ENV))?;
    let config = WorkerConfig::load(&path)?;
    info!(
        path = %path,
        models = config.pipeline.models.len(),
        streams = config.pipeline.streams.len(),
        "Loaded pipeline configuration"
    );

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start Prometheus exporter")?;
        info!("Serving metrics on {}", addr);
    }

    let dispatcher = Arc::new(
        WebhookDispatcher::start(&config.pipeline.webhook, &tokio::runtime::Handle::current())
            .map_err(PipelineError::from)?,
    );
    let drain_grace = config.pipeline.pool.shutdown_grace();
    let runtime = Arc::new(PipelineRuntime::new(config.pipeline, Arc::clone(&dispatcher)));

    // Session start may load models; keep it off the async workers
    let started = {
        let runtime = Arc::clone(&runtime);
        tokio::task::spawn_blocking(move || runtime.start_configured()).await?
    };

    let mut setup_failure = None;
    for (stream_id, result) in started {
        match result {
            Ok(handle) => info!(session = %handle, "Session started"),
            Err(e @ PipelineError::Setup(_)) => {
                error!(stream_id = %stream_id, "Pipeline setup failed: {}", e);
                setup_failure.get_or_insert(e);
            }
            Err(e) => warn!(stream_id = %stream_id, "Session did not start: {}", e),
        }
    }

    if setup_failure.is_none() {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Received shutdown signal");
    }

    let stats = {
        let runtime = Arc::clone(&runtime);
        tokio::task::spawn_blocking(move || runtime.shutdown()).await?
    };
    dispatcher.shutdown(drain_grace).await;

    if let Some(e) = setup_failure {
        return Err(e.into());
    }

    let delivered = dispatcher.stats().delivered;
    info!(
        sessions = stats.sessions.len(),
        webhooks_delivered = delivered,
        "Worker shutdown complete"
    );
    Ok(())
}
