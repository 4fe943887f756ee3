use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;

/// Background task that periodically auto-cancels blocked bookings whose
/// grace period has run out.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.auto_cancel_expired_blocks().await {
            Ok(0) => debug!("sweep: nothing expired"),
            Ok(n) => info!("sweep: auto-cancelled {n} blocked bookings"),
            Err(e) => error!("sweep failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends have piled up,
/// and drops idle per-user and per-session locks on every tick.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let pruned = engine.prune_idle_locks();
        if pruned > 0 {
            debug!("pruned {pruned} idle locks");
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
