//! Standalone sweeper for a gymbook data directory.
//!
//! The sweeper is the only engine host for its WAL: it takes the WAL's owner
//! lock on startup and exits if an application engine already holds it.
//! Applications that embed the engine run `reaper::run_reaper` in-process
//! instead of starting this binary.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use gymbook::clock::SystemClock;
use gymbook::config::{EngineConfig, ServiceConfig};
use gymbook::engine::Engine;
use gymbook::notify::NotifyHub;
use gymbook::services::{InMemoryDirectory, Services};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let service = ServiceConfig::from_env();
    let config = EngineConfig::from_env();
    gymbook::observability::init(service.metrics_port);

    std::fs::create_dir_all(&service.data_dir)?;

    let clock = Arc::new(SystemClock);
    let directory = Arc::new(InMemoryDirectory::new(clock.clone()));
    let services = Services {
        membership: directory.clone(),
        trainers: directory,
        notifications: Arc::new(NotifyHub::new()),
        clock,
    };
    let engine = match Engine::new(service.wal_path(), services, config) {
        Ok(engine) => Arc::new(engine),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            error!("{e}; run the reaper inside that process instead");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    info!("gymbook sweeper");
    info!("  data_dir: {}", service.data_dir.display());
    info!("  grace: {}h", engine.config().block_grace_hours);
    info!(
        "  metrics: {}",
        service
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    if service.sweep_interval_secs == 0 {
        let cancelled = engine.auto_cancel_expired_blocks().await?;
        info!("single sweep cancelled {cancelled} bookings");
        return Ok(());
    }

    let every = Duration::from_secs(service.sweep_interval_secs);
    info!("  sweep interval: {}s", service.sweep_interval_secs);
    let reaper = tokio::spawn(gymbook::reaper::run_reaper(engine.clone(), every));
    let compactor = tokio::spawn(gymbook::reaper::run_compactor(
        engine.clone(),
        service.compact_threshold,
        every,
    ));

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received");
    reaper.abort();
    compactor.abort();
    info!("gymbook sweeper stopped");
    Ok(())
}
