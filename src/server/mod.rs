// src/server/mod.rs

//! Top-level server orchestration: wires configuration into every component,
//! spawns the background tasks, then blocks on shutdown (C14).

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{filter::EnvFilter, reload};

use crate::config::Config;

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
mod spawner;

/// Initializes, spawns, and runs the fleet manager until a shutdown signal
/// is received.
pub async fn run(
    config: Config,
    config_path: impl Into<std::path::PathBuf>,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    let mut server_context = initialization::setup(config, config_path, log_reload_handle).await?;
    spawner::spawn_all(&mut server_context).await?;
    connection_loop::run(server_context).await;
    Ok(())
}
