use std::sync::Arc;

use tracing::info;

use agenda::compactor;
use agenda::config::Config;
use agenda::engine::Engine;
use agenda::notify::NotifyHub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    agenda::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(config.wal_path(), notify, config.engine.clone())?);
    info!("agenda engine ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  request_timeout: {:?}", config.engine.request_timeout);
    info!("  compact_threshold: {}", config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    let compactor = tokio::spawn(async move {
        compactor::run_compactor(compactor_engine, threshold).await;
    });

    shutdown_signal().await?;
    info!("shutdown signal received");
    compactor.abort();

    // Leave a short log behind for the next start.
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("agenda stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
