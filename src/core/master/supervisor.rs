// src/core/master/supervisor.rs

//! The single supervisor loop driving both master authentication and the
//! chat keep-alive (§4.7). Reconnects are driven entirely from this one
//! task rather than per-event handlers, which is what prevents reconnect
//! storms: a transport error anywhere just flips state and falls through to
//! the loop's own re-evaluation on its next tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, error, info, warn};

use crate::config::ConfigHandle;
use crate::core::errors::FleetResult;
use crate::core::events::{EventBus, FleetEvent};
use crate::core::metrics;

use super::auth::{self, AuthResponse};
use super::chat::{self, ServerInfo};
use super::ip;

/// How long the supervisor sleeps between re-evaluations when there is
/// nothing to do (already authenticated, chat connected or address
/// unknown).
const SUPERVISOR_TICK: Duration = Duration::from_secs(10);
/// Fixed backoff between authentication attempts (§5 timeouts).
const AUTH_RETRY_INTERVAL: Duration = Duration::from_secs(30);
/// Attempts before authentication gives up for this cycle (§5 timeouts).
const MAX_AUTH_ATTEMPTS: u32 = 10;
const CHAT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const CHAT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The master/chat auth state (§3 "Auth state"). `authenticated` is the
/// invariant I5 gate: the chat handshake must never be attempted while this
/// is false.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub authenticated: bool,
    pub session_id: Option<String>,
    pub server_id: Option<i64>,
    pub chat_host: Option<String>,
    pub chat_port: Option<u16>,
    pub last_authenticated_at: Option<Instant>,
}

pub struct MasterClient {
    config: ConfigHandle,
    events: Arc<EventBus>,
    http: reqwest::Client,
    state: AsyncMutex<AuthState>,
    chat_connected: AtomicBool,
    external_ip: AsyncMutex<Option<String>>,
}

impl MasterClient {
    pub fn new(config: ConfigHandle, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            http: reqwest::Client::new(),
            state: AsyncMutex::new(AuthState::default()),
            chat_connected: AtomicBool::new(false),
            external_ip: AsyncMutex::new(None),
        })
    }

    pub async fn auth_snapshot(&self) -> AuthState {
        self.state.lock().await.clone()
    }

    pub fn is_chat_connected(&self) -> bool {
        self.chat_connected.load(Ordering::Relaxed)
    }

    /// Resolves (and caches) the host's externally-visible IP, shared with
    /// the proxy runner so both C4 and C7 agree on the same address (§4.4,
    /// §4.7).
    pub async fn resolved_external_ip(&self) -> String {
        let mut cached = self.external_ip.lock().await;
        if let Some(ip) = cached.as_ref() {
            return ip.clone();
        }
        let config = self.config.current();
        let resolved = match config.master.external_ip {
            Some(ip) => ip,
            None => ip::discover_external_ip(&self.http).await,
        };
        *cached = Some(resolved.clone());
        resolved
    }

    /// Runs the supervisor loop until `shutdown_rx` fires (§5 cancellation:
    /// C7 tears down chat then master).
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let authenticated = self.state.lock().await.authenticated;

            if !authenticated {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => return,
                    result = self.authenticate_with_retries() => {
                        match result {
                            Ok(response) => self.apply_authenticated(response).await,
                            Err(_) => {
                                // Ceiling already logged inside authenticate_with_retries;
                                // fall through to the normal tick before trying again.
                                if sleep_or_shutdown(SUPERVISOR_TICK, &mut shutdown_rx).await {
                                    return;
                                }
                            }
                        }
                    }
                }
                continue;
            }

            let chat_addr = self.resolve_chat_address().await;
            if self.chat_connected.load(Ordering::Relaxed) || chat_addr.is_none() {
                if sleep_or_shutdown(SUPERVISOR_TICK, &mut shutdown_rx).await {
                    return;
                }
                continue;
            }

            let (host, port) = chat_addr.unwrap();
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                _ = self.run_chat_with_backoff(&host, port) => {}
            }
        }
    }

    async fn authenticate_with_retries(&self) -> FleetResult<AuthResponse> {
        let config = self.config.current();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match auth::authenticate(&self.http, &config.master).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt >= MAX_AUTH_ATTEMPTS => {
                    error!("master authentication failed after {attempt} attempts, giving up for this cycle: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!("master authentication attempt {attempt}/{MAX_AUTH_ATTEMPTS} failed: {e}");
                    tokio::time::sleep(AUTH_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn apply_authenticated(&self, response: AuthResponse) {
        let mut state = self.state.lock().await;
        state.authenticated = true;
        state.session_id = Some(response.session_id);
        state.server_id = Some(response.server_id);
        state.chat_host = response.chat_host;
        state.chat_port = response.chat_port;
        state.last_authenticated_at = Some(Instant::now());
        drop(state);
        metrics::MASTER_AUTHENTICATED.set(1.0);
        self.events.publish(FleetEvent::AuthChanged { authenticated: true });
        info!("authenticated with master server");
    }

    async fn resolve_chat_address(&self) -> Option<(String, u16)> {
        let state = self.state.lock().await;
        if let (Some(host), Some(port)) = (state.chat_host.clone(), state.chat_port) {
            return Some((host, port));
        }
        drop(state);
        let config = self.config.current();
        match (config.master.chat_host, config.master.chat_port) {
            (Some(host), Some(port)) => Some((host, port)),
            _ => None,
        }
    }

    /// Dials the chat server with capped exponential backoff between
    /// attempts, then runs one session to completion (§4.7).
    async fn run_chat_with_backoff(&self, host: &str, port: u16) {
        let mut backoff = CHAT_INITIAL_BACKOFF;
        loop {
            let server_info = self.build_server_info().await;
            let this_connected = &self.chat_connected;
            let events = self.events.clone();
            let on_handshake_accepted = move || {
                this_connected.store(true, Ordering::Relaxed);
                metrics::CHAT_CONNECTED.set(1.0);
                events.publish(FleetEvent::ChatChanged { connected: true });
            };

            match chat::run_session(host, port, &server_info, on_handshake_accepted).await {
                Ok(chat::ChatOutcome::Disconnected) => {
                    debug!("chat session to {host}:{port} closed");
                }
                Ok(chat::ChatOutcome::ProtocolError(e)) => {
                    debug!("chat session to {host}:{port} protocol error: {e}");
                }
                Err(e) => {
                    debug!("chat session to {host}:{port} failed to establish: {e}, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(CHAT_MAX_BACKOFF);
                    continue;
                }
            }

            if self.chat_connected.swap(false, Ordering::Relaxed) {
                metrics::CHAT_CONNECTED.set(0.0);
                self.events.publish(FleetEvent::ChatChanged { connected: false });
            }
            return;
        }
    }

    async fn build_server_info(&self) -> ServerInfo {
        let config = self.config.current();
        let server_id = self.state.lock().await.server_id.unwrap_or_default();
        let external_ip = self.resolved_external_ip().await;
        ServerInfo {
            server_id,
            login: config.master.login.clone(),
            region: config.host.location.clone(),
            display_name: config.host.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            external_ip,
            ping_port: config.host.base_voice_port,
        }
    }
}

/// Sleeps for `duration` unless shutdown fires first; returns `true` if
/// shutdown won the race.
async fn sleep_or_shutdown(duration: Duration, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_rx.recv() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn new_client_starts_unauthenticated_and_chat_disconnected() {
        let config = ConfigHandle::new("/tmp/does-not-matter.toml", Config::default());
        let events = Arc::new(EventBus::new());
        let client = MasterClient::new(config, events);
        assert!(!client.auth_snapshot().await.authenticated);
        assert!(!client.is_chat_connected());
    }

    #[tokio::test]
    async fn resolve_chat_address_falls_back_to_config_when_state_is_empty() {
        let mut base = Config::default();
        base.master.chat_host = Some("chat.example.com".to_string());
        base.master.chat_port = Some(9000);
        let config = ConfigHandle::new("/tmp/does-not-matter.toml", base);
        let events = Arc::new(EventBus::new());
        let client = MasterClient::new(config, events);

        let addr = client.resolve_chat_address().await;
        assert_eq!(addr, Some(("chat.example.com".to_string(), 9000)));
    }
}
