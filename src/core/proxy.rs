// src/core/proxy.rs

//! The proxy runner (C4): for each instance with `proxy-enabled`, owns a
//! companion NAT/port-proxy process whose sole argument is a per-instance
//! text config file. Mirrors the supervisor's child-process bookkeeping
//! style (§4.3) but the companion process is not part of the C3 state
//! machine: it is keyed purely off `proxy_enabled` and reconciled on config
//! reload, independent of instance lifecycle.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use dashmap::DashMap;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigHandle};
use crate::core::registry::{Instance, InstanceRegistry};

/// Owns the live proxy child processes, one per proxied instance, and the
/// per-instance config/sidecar files that describe them on disk.
pub struct ProxyRunner {
    registry: std::sync::Arc<InstanceRegistry>,
    config: ConfigHandle,
    children: DashMap<u32, Child>,
}

impl ProxyRunner {
    pub fn new(registry: std::sync::Arc<InstanceRegistry>, config: ConfigHandle) -> Self {
        Self {
            registry,
            config,
            children: DashMap::new(),
        }
    }

    fn config_path(config: &Config, id: u32) -> PathBuf {
        config.proxy.config_dir.join(format!("instance{id}.cfg"))
    }

    fn sidecar_path(config: &Config, id: u32) -> PathBuf {
        config.proxy.config_dir.join(format!("instance{id}.pid"))
    }

    /// Renders the proxy's per-instance config file contents (§4.4).
    fn render_config(config: &Config, instance: &Instance, external_ip: &str) -> String {
        let mut out = String::new();
        let redirect_port = instance.game_port;
        let public_port = instance.game_port + 10_000;
        let voice_redirect_port = instance.voice_port;
        let voice_public_port = instance.voice_port + 10_000;
        let _ = writeln!(out, "redirectIP=127.0.0.1");
        let _ = writeln!(out, "publicip={external_ip}");
        let _ = writeln!(out, "publicPort={public_port}");
        let _ = writeln!(out, "redirectPort={redirect_port}");
        let _ = writeln!(out, "voiceRedirectPort={voice_redirect_port}");
        let _ = writeln!(out, "voicePublicPort={voice_public_port}");
        let _ = writeln!(out, "region={}", config.proxy.region);
        out
    }

    /// Ensures a proxy process is running for `id`, reusing a live one if the
    /// sidecar pid file still resolves to it, and rewrites the config file
    /// only when its contents actually change (§4.4).
    pub async fn ensure_running(&self, id: u32, external_ip: &str) {
        let Some(instance) = self.registry.get(id) else {
            return;
        };
        if !instance.proxy_enabled {
            return;
        }
        let config = self.config.current();
        if let Err(e) = tokio::fs::create_dir_all(&config.proxy.config_dir).await {
            warn!("proxy instance {id}: failed to create config dir: {e}");
            return;
        }

        let config_path = Self::config_path(&config, id);
        let desired = Self::render_config(&config, &instance, external_ip);
        let needs_write = match tokio::fs::read_to_string(&config_path).await {
            Ok(existing) => existing != desired,
            Err(_) => true,
        };
        if needs_write {
            if let Err(e) = tokio::fs::write(&config_path, &desired).await {
                warn!("proxy instance {id}: failed to write config file: {e}");
                return;
            }
            debug!("proxy instance {id}: wrote updated config to {}", config_path.display());
        }

        if self.is_alive(id).await {
            return;
        }
        if self.adopt_from_sidecar(&config, id).await {
            return;
        }

        self.spawn(&config, id, &config_path).await;
    }

    async fn is_alive(&self, id: u32) -> bool {
        let Some(mut entry) = self.children.get_mut(&id) else {
            return false;
        };
        matches!(entry.try_wait(), Ok(None))
    }

    /// Reads the sidecar pid file and, where the platform exposes a process
    /// table, cross-checks the running image name before trusting a pid
    /// that was not spawned by this process (avoids adopting an unrelated
    /// process that happens to reuse a recycled pid, §4.4).
    async fn adopt_from_sidecar(&self, config: &Config, id: u32) -> bool {
        let sidecar = Self::sidecar_path(config, id);
        let Ok(contents) = tokio::fs::read_to_string(&sidecar).await else {
            return false;
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            return false;
        };

        let expected_image = config
            .proxy
            .binary_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let alive = process_image_matches(pid, expected_image.as_deref());
        if alive {
            debug!("proxy instance {id}: adopted live process pid={pid} from sidecar");
        }
        alive
    }

    async fn spawn(&self, config: &Config, id: u32, config_path: &PathBuf) {
        let mut command = tokio::process::Command::new(&config.proxy.binary_path);
        command.arg(config_path);
        match command.spawn() {
            Ok(child) => {
                if let Some(pid) = child.id() {
                    let sidecar = Self::sidecar_path(config, id);
                    if let Err(e) = tokio::fs::write(&sidecar, pid.to_string()).await {
                        warn!("proxy instance {id}: failed to write pid sidecar: {e}");
                    }
                }
                info!("proxy instance {id}: spawned companion proxy pid={:?}", child.id());
                self.children.insert(id, child);
            }
            Err(e) => {
                warn!("proxy instance {id}: failed to spawn companion proxy: {e}");
            }
        }
    }

    /// Stops every live proxy child. Called on shutdown and whenever a
    /// config reload toggles proxying off fleet-wide (§4.4).
    pub async fn stop_all(&self) {
        let ids: Vec<u32> = self.children.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, mut child)) = self.children.remove(&id) {
                let _ = child.start_kill();
            }
        }
    }

    pub async fn stop(&self, id: u32) {
        if let Some((_, mut child)) = self.children.remove(&id) {
            let _ = child.start_kill();
        }
    }

    /// Reconciles the whole fleet against the current `proxy_enabled`
    /// toggle: spawns/reuses runners for every proxied instance, stops every
    /// runner for an instance that is no longer proxied, and reverts
    /// `public_port` back to `port` fleet-wide when proxying is globally off
    /// (§4.1, §4.4).
    pub async fn reconcile(&self, external_ip: &str) {
        let config = self.config.current();
        if !config.features.proxy_enabled {
            self.stop_all().await;
            for instance in self.registry.snapshot() {
                self.registry.mutate(instance.id, |i| {
                    i.proxy_enabled = false;
                    i.public_port = i.game_port;
                });
            }
            return;
        }

        let mut still_proxied: HashMap<u32, bool> = HashMap::new();
        for instance in self.registry.snapshot() {
            self.registry.mutate(instance.id, |i| {
                i.proxy_enabled = true;
                i.public_port = i.game_port + 10_000;
            });
            still_proxied.insert(instance.id, true);
            self.ensure_running(instance.id, external_ip).await;
        }

        let stale: Vec<u32> = self
            .children
            .iter()
            .map(|e| *e.key())
            .filter(|id| !still_proxied.contains_key(id))
            .collect();
        for id in stale {
            self.stop(id).await;
        }
    }
}

/// Best-effort liveness/identity check for an adopted pid. On platforms
/// without an accessible process table this conservatively returns `false`
/// (never adopt), forcing a fresh spawn instead of trusting a stale pid.
fn process_image_matches(pid: u32, expected_image: Option<&str>) -> bool {
    #[cfg(target_os = "linux")]
    {
        let exe_link = format!("/proc/{pid}/exe");
        let Ok(target) = std::fs::read_link(&exe_link) else {
            return false;
        };
        match expected_image {
            Some(expected) => target
                .file_name()
                .map(|n| n.to_string_lossy() == expected)
                .unwrap_or(false),
            None => true,
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (pid, expected_image);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_config_derives_proxy_ports_from_game_and_voice_ports() {
        let config = Config::default();
        let instance = Instance::new(1, 7900, 7950, None);
        let rendered = ProxyRunner::render_config(&config, &instance, "203.0.113.9");
        assert!(rendered.contains("publicip=203.0.113.9"));
        assert!(rendered.contains("publicPort=17900"));
        assert!(rendered.contains("redirectPort=7900"));
        assert!(rendered.contains("voicePublicPort=17950"));
        assert!(rendered.contains("voiceRedirectPort=7950"));
    }

    #[test]
    fn render_config_is_deterministic_for_unchanged_inputs() {
        let config = Config::default();
        let instance = Instance::new(2, 7901, 7951, None);
        let a = ProxyRunner::render_config(&config, &instance, "1.2.3.4");
        let b = ProxyRunner::render_config(&config, &instance, "1.2.3.4");
        assert_eq!(a, b);
    }
}
