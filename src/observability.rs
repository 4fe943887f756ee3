use std::net::SocketAddr;

use crate::engine::FailedCheck;

// ── Validation ──────────────────────────────────────────────────

/// Counter: validation runs. Labels: pipeline, outcome.
pub const VALIDATIONS_TOTAL: &str = "gymbook_validations_total";

/// Histogram: validation latency in seconds. Labels: pipeline.
pub const VALIDATION_DURATION_SECONDS: &str = "gymbook_validation_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: bookings stored as confirmed. Labels: pipeline.
pub const BOOKINGS_CREATED_TOTAL: &str = "gymbook_bookings_created_total";

/// Counter: confirmed bookings moved to blocked.
pub const BOOKINGS_BLOCKED_TOTAL: &str = "gymbook_bookings_blocked_total";

/// Counter: blocked bookings cancelled by the sweep.
pub const BOOKINGS_AUTO_CANCELLED_TOTAL: &str = "gymbook_bookings_auto_cancelled_total";

/// Counter: notifications the collaborator failed to deliver.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "gymbook_notification_failures_total";

/// Histogram: sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "gymbook_sweep_duration_seconds";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gymbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gymbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Outcome label for a validation result.
pub fn outcome_label(failed: Option<FailedCheck>) -> &'static str {
    failed.map_or("approved", |c| c.as_str())
}
