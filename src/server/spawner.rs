// src/server/spawner.rs

//! Spawns all of the fleet manager's long-running background tasks into the
//! shared `JoinSet`, mirroring this codebase's one-task-per-component style.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

use super::context::ServerContext;
use super::metrics_server;
use crate::core::control::run_listener;
use crate::core::events::run_metrics_sink;

/// How often the proxy runner re-checks the fleet against the current
/// `proxy_enabled` toggle and instance set (§4.4).
const PROXY_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns every background task into `ctx.background_tasks`.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;
    let config = state.config.current();

    // --- Metrics server (C13, ambient) ---
    if config.metrics.enabled {
        let metrics_state = state.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, shutdown_rx).await;
            Ok(())
        });
    } else {
        info!("metrics server disabled in configuration");
    }

    // --- Event-bus metrics sink ---
    {
        let rx = state.events.subscribe();
        background_tasks.spawn(async move {
            run_metrics_sink(rx).await;
            Ok(())
        });
    }

    // --- Manager control channel (C5) ---
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.host.manager_port));
        let plane = state.control.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            run_listener(addr, plane, shutdown_rx)
                .await
                .map_err(|e| anyhow!("control-channel listener failed: {e}"))
        });
    }

    // --- Master/chat client (C7) ---
    {
        let master = state.master.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            master.run(shutdown_rx).await;
            Ok(())
        });
    }

    // --- Restart policy sweep (C9) ---
    {
        let restart_policy = state.restart_policy.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            restart_policy.run(shutdown_rx).await;
            Ok(())
        });
    }

    // --- Proxy reconciliation (C4) ---
    {
        let proxy = state.proxy.clone();
        let master = state.master.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            loop {
                let external_ip = master.resolved_external_ip().await;
                proxy.reconcile(&external_ip).await;
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(PROXY_RECONCILE_INTERVAL) => {}
                }
            }
            proxy.stop_all().await;
            Ok(())
        });
    }

    // --- Live log-level reload (C1 -> C11) ---
    {
        let mut config_rx = state.config.subscribe();
        let reload_handle = state.log_reload_handle.clone();
        let mut current_level = config.log_level.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let new_level = config_rx.borrow().log_level.clone();
                        if new_level != current_level {
                            match reload_handle.reload(EnvFilter::new(&new_level)) {
                                Ok(()) => info!("log level reloaded to '{new_level}'"),
                                Err(e) => warn!("failed to reload log level to '{new_level}': {e}"),
                            }
                            current_level = new_level;
                        }
                    }
                }
            }
            Ok(())
        });
    }

    info!("all background tasks have been spawned");
    Ok(())
}
