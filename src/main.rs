use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use convo_pipeline::analysis::{KeywordIntentAnalyzer, LexiconEmotionAnalyzer, RealTimeProcessor};
use convo_pipeline::api;
use convo_pipeline::config::PipelineConfig;
use convo_pipeline::ingestion::IngestionQueue;
use convo_pipeline::orchestrator::{
    HttpWebhookDelivery, InMemoryMonitor, NotificationHub, PipelineOrchestrator,
};
use convo_pipeline::tenant::TenantConfigManager;

#[tokio::main]
async fn main() -> Result<()> {
    let config = PipelineConfig::from_env();
    let _log_guard = init_tracing(config.server.log_dir.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        environment = %config.tenants.environment,
        "Starting convo-pipeline"
    );

    // ── Services ────────────────────────────────────────────────────────
    let queue = IngestionQueue::new(config.ingestion.clone());
    let processor = RealTimeProcessor::new(
        config.processor.clone(),
        Arc::new(LexiconEmotionAnalyzer::new()),
        Arc::new(KeywordIntentAnalyzer::new()),
    );
    let tenants = TenantConfigManager::new(config.tenants.clone());
    let webhooks = HttpWebhookDelivery::new(config.orchestrator.webhook_timeout)
        .context("Failed to build webhook client")?;

    let orchestrator = PipelineOrchestrator::new(
        config.orchestrator.clone(),
        queue,
        processor,
        tenants,
        Arc::new(InMemoryMonitor::new()),
        Arc::new(NotificationHub::new()),
        Arc::new(webhooks),
    );
    orchestrator.start().await;

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = api::router(Arc::clone(&orchestrator));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server.port))?;
    info!(port = config.server.port, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    orchestrator.cleanup().await;
    info!("Shutdown complete");
    Ok(())
}

/// Stderr logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&str>) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {dir}"))?;
            let appender = tracing_appender::rolling::daily(dir, "convo-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
