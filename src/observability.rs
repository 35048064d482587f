use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "agenda_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "agenda_operation_duration_seconds";

/// Counter: bookings or reschedules rejected for overlapping an appointment.
pub const CONFLICTS_TOTAL: &str = "agenda_conflicts_total";

/// Histogram: slots returned per availability query.
pub const SLOTS_EMITTED: &str = "agenda_slots_emitted";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: lock waits that timed out and were retried.
pub const LOCK_RETRIES_TOTAL: &str = "agenda_lock_retries_total";

/// Gauge: scheduled appointments held in memory.
pub const APPOINTMENTS_SCHEDULED: &str = "agenda_appointments_scheduled";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "agenda_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "agenda_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "agenda_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Record count and latency of one engine operation, labelled by outcome.
pub fn record<T>(op: &'static str, started: Instant, result: &Result<T, EngineError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
    if let Err(EngineError::Conflict(_)) = result {
        metrics::counter!(CONFLICTS_TOTAL, "op" => op).increment(1);
    }
}
