// src/server/connection_loop.rs

//! Top-level shutdown orchestration (C14). Unlike a listening server, this
//! fleet manager has no client-facing accept loop here: C5's control-channel
//! listener owns its own accept loop as a spawned background task. This loop
//! only watches for a shutdown signal or a background task dying
//! unexpectedly, then drives the bounded shutdown sequence (§5).

use std::time::Duration;

use tracing::{error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
#[cfg(windows)]
use tokio::signal;

use super::context::ServerContext;

/// `15s` fixed budget plus the graceful-drain deadline the process
/// supervisor already enforces per child (§5 `15s + graceful_drain_deadline`).
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown"),
        }
    }
    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
        info!("Ctrl-C received, initiating graceful shutdown");
    }
}

/// Runs until a shutdown signal fires or a background task dies
/// unexpectedly, then drains every component in order: C5 sessions close
/// when the listener task sees the broadcast, C3 children are stopped
/// explicitly here, and C7/C9/C4 unwind on their own per §5.
pub async fn run(mut ctx: ServerContext) {
    tokio::select! {
        biased;
        _ = await_shutdown_signal() => {}
        Some(res) = ctx.background_tasks.join_next() => {
            match res {
                Ok(Ok(())) => info!("a background task exited on its own"),
                Ok(Err(e)) => error!("background task failed, shutting down: {e}"),
                Err(e) => error!("background task panicked, shutting down: {e:?}"),
            }
        }
    }

    info!("shutting down: broadcasting cancellation to all tasks");
    if ctx.shutdown_tx.send(()).is_err() {
        warn!("shutdown broadcast had no active receivers");
    }

    info!("stopping all instance child processes");
    if let Err(e) = ctx.state.supervisor.stop_all().await {
        warn!("error while stopping instances during shutdown: {e}");
    }

    info!("waiting for background tasks to unwind");
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for background tasks to finish cleanly");
    }

    info!("fleet manager shutdown complete");
}
