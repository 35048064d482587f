use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL once `threshold` appends have piled up since the last
/// compaction. Returns whether it ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that keeps the WAL short.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        match compact_if_due(&engine, threshold).await {
            Ok(true) => {}
            Ok(false) => debug!("compaction not due"),
            // Retried on the next tick.
            Err(e) => warn!("compaction failed: {e}"),
        }
    }
}
