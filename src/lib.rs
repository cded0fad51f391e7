pub mod cli;
pub mod logging;
pub mod proxy;
pub mod settings;
pub mod shutdown;
pub mod util;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use proxy::AppContext;
use proxy::cache::{CacheDirectory, EntryStatus};
use settings::Settings;
use shutdown::{ShutdownCoordinator, ShutdownSignal};

/// Wire everything together and run until a shutdown signal arrives, then
/// drain the cache so blocked readers and fetchers unwind within the grace
/// period.
pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let shutdown = ShutdownCoordinator::new();
    let directory = CacheDirectory::new(settings.max_entries);
    let app = AppContext::new(settings.clone(), directory.clone(), shutdown.clone());

    spawn_signal_task(shutdown.clone());
    if let Some(interval) = settings.stats_interval() {
        spawn_stats_task(directory.clone(), shutdown.signal(), interval);
    }

    proxy::run(app).await?;

    directory.drain(settings.shutdown_grace()).await;
    info!("shutdown complete");
    Ok(())
}

fn spawn_signal_task(shutdown: ShutdownCoordinator) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to install SIGINT handler");
            return std::future::pending().await;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn spawn_stats_task(directory: CacheDirectory, mut shutdown: ShutdownSignal, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; skip the startup tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = directory.stats();
                    let total_bytes: usize = stats.iter().map(|entry| entry.size).sum();
                    let loading = stats
                        .iter()
                        .filter(|entry| entry.status == EntryStatus::Loading)
                        .count();
                    let attached: usize = stats.iter().map(|entry| entry.ref_count).sum();
                    let oldest_secs = stats
                        .iter()
                        .map(|entry| entry.age.as_secs())
                        .max()
                        .unwrap_or(0);
                    info!(
                        entries = stats.len(),
                        loading,
                        attached,
                        total_bytes,
                        oldest_secs,
                        "cache statistics"
                    );
                }
                _ = shutdown.triggered() => return,
            }
        }
    });
}
