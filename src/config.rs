// src/config.rs

//! Loads, validates, and atomically persists the fleet manager's configuration
//! tree (C1): host runtime, feature toggles, and external-service
//! credentials. Mirrors this codebase's raw/resolved config split: a
//! `RawConfig` with serde defaults is parsed from disk, then resolved into an
//! immutable `Config` the rest of the system holds a live reference to.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Host runtime settings: identity, ports, and filesystem layout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HostConfig {
    #[serde(default = "default_host_name")]
    pub name: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_base_game_port")]
    pub base_game_port: u16,
    #[serde(default = "default_base_voice_port")]
    pub base_voice_port: u16,
    #[serde(default = "default_manager_port")]
    pub manager_port: u16,
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
    #[serde(default)]
    pub suppress_console: bool,
}

fn default_host_name() -> String {
    "fleet-host".to_string()
}
fn default_location() -> String {
    "unknown".to_string()
}
fn default_base_game_port() -> u16 {
    7900
}
fn default_base_voice_port() -> u16 {
    7950
}
fn default_manager_port() -> u16 {
    8100
}
fn default_install_dir() -> PathBuf {
    PathBuf::from("/opt/fleetd/install")
}
fn default_home_dir() -> PathBuf {
    PathBuf::from("/opt/fleetd/home")
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: default_host_name(),
            location: default_location(),
            priority: 0,
            base_game_port: default_base_game_port(),
            base_voice_port: default_base_voice_port(),
            manager_port: default_manager_port(),
            install_dir: default_install_dir(),
            home_dir: default_home_dir(),
            suppress_console: false,
        }
    }
}

/// Auto-scaling limits used by the scaling engine (C8).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AutoScalingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_instances")]
    pub min: usize,
    #[serde(default = "default_max_instances")]
    pub max: usize,
    #[serde(default = "default_min_idle_ready")]
    pub min_idle_ready: usize,
}

fn default_min_instances() -> usize {
    0
}
fn default_max_instances() -> usize {
    32
}
fn default_min_idle_ready() -> usize {
    1
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min: default_min_instances(),
            max: default_max_instances(),
            min_idle_ready: default_min_idle_ready(),
        }
    }
}

/// Feature toggles (§4.1).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FeaturesConfig {
    #[serde(default)]
    pub proxy_enabled: bool,
    #[serde(default)]
    pub cowmaster_forking: bool,
    #[serde(default = "default_true")]
    pub bot_matches_allowed: bool,
    #[serde(default)]
    pub auto_start_on_launch: bool,
    #[serde(default)]
    pub auto_scaling: AutoScalingConfig,
    #[serde(default = "default_per_core_factor")]
    pub per_core_server_factor: f64,
}

fn default_true() -> bool {
    true
}
fn default_per_core_factor() -> f64 {
    1.0
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            proxy_enabled: false,
            cowmaster_forking: false,
            bot_matches_allowed: true,
            auto_start_on_launch: false,
            auto_scaling: AutoScalingConfig::default(),
            per_core_server_factor: default_per_core_factor(),
        }
    }
}

/// Restart-policy recycle window (C9).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RestartPolicyConfig {
    #[serde(with = "humantime_serde", default = "default_min_uptime")]
    pub min_uptime: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_max_uptime")]
    pub max_uptime: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub check_interval: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_max_wait_for_game")]
    pub max_wait_for_game: std::time::Duration,
}

fn default_min_uptime() -> std::time::Duration {
    std::time::Duration::from_secs(6 * 3600)
}
fn default_max_uptime() -> std::time::Duration {
    std::time::Duration::from_secs(12 * 3600)
}
fn default_check_interval() -> std::time::Duration {
    std::time::Duration::from_secs(60)
}
fn default_max_wait_for_game() -> std::time::Duration {
    std::time::Duration::from_secs(3600)
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            min_uptime: default_min_uptime(),
            max_uptime: default_max_uptime(),
            check_interval: default_check_interval(),
            max_wait_for_game: default_max_wait_for_game(),
        }
    }
}

/// Master/chat authentication credentials and addressing (C7).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MasterConfig {
    #[serde(default)]
    pub master_url: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
    /// Fallback chat coordinates, used when the master's auth response omits
    /// them (§4.7, §6).
    #[serde(default)]
    pub chat_host: Option<String>,
    #[serde(default)]
    pub chat_port: Option<u16>,
    /// Externally-visible IP; if unset it is discovered at startup via an
    /// ordered list of echo services.
    #[serde(default)]
    pub external_ip: Option<String>,
}

/// Proxy runner configuration (C4): where the companion NAT/port-proxy
/// binary lives and what per-instance config files it expects.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_binary")]
    pub binary_path: PathBuf,
    #[serde(default = "default_proxy_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_proxy_binary() -> PathBuf {
    PathBuf::from("/opt/fleetd/proxy/proxy-runner")
}
fn default_proxy_config_dir() -> PathBuf {
    PathBuf::from("/opt/fleetd/proxy/instances")
}
fn default_region() -> String {
    "unknown".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary_path: default_proxy_binary(),
            config_dir: default_proxy_config_dir(),
            region: default_region(),
        }
    }
}

/// Metrics endpoint configuration (C13, ambient).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9900
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// Raw, partially-defaulted representation of the config file.
#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    host: HostConfig,
    #[serde(default)]
    features: FeaturesConfig,
    #[serde(default)]
    restart_policy: RestartPolicyConfig,
    #[serde(default)]
    master: MasterConfig,
    #[serde(default)]
    proxy: ProxyConfig,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_start_at_once")]
    max_start_at_once: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_start_at_once() -> usize {
    4
}

/// The final, validated, resolved configuration. Read accessors return by
/// value (`Config` is `Clone`); mutation always goes through [`Config::save`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: HostConfig,
    pub features: FeaturesConfig,
    pub restart_policy: RestartPolicyConfig,
    pub master: MasterConfig,
    pub proxy: ProxyConfig,
    pub metrics: MetricsConfig,
    pub log_level: String,
    pub max_start_at_once: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            features: FeaturesConfig::default(),
            restart_policy: RestartPolicyConfig::default(),
            master: MasterConfig::default(),
            proxy: ProxyConfig::default(),
            metrics: MetricsConfig::default(),
            log_level: default_log_level(),
            max_start_at_once: default_max_start_at_once(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{}'", path.display()))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{}'", path.display()))?;

        let config = Config {
            host: raw.host,
            features: raw.features,
            restart_policy: raw.restart_policy,
            master: raw.master,
            proxy: raw.proxy,
            metrics: raw.metrics,
            log_level: raw.log_level,
            max_start_at_once: raw.max_start_at_once,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.host.manager_port == 0 {
            return Err(anyhow!("host.manager_port cannot be 0"));
        }
        if self.host.base_game_port == 0 || self.host.base_voice_port == 0 {
            return Err(anyhow!("host.base_game_port/base_voice_port cannot be 0"));
        }
        if self.max_start_at_once == 0 {
            return Err(anyhow!("max_start_at_once cannot be 0"));
        }
        if self.features.per_core_server_factor <= 0.0 {
            return Err(anyhow!("features.per_core_server_factor must be positive"));
        }
        if self.features.auto_scaling.enabled && self.features.auto_scaling.min > self.features.auto_scaling.max {
            return Err(anyhow!("features.auto_scaling.min cannot exceed max"));
        }
        if self.restart_policy.min_uptime > self.restart_policy.max_uptime {
            return Err(anyhow!("restart_policy.min_uptime cannot exceed max_uptime"));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0 when metrics are enabled"));
        }
        Ok(())
    }

    /// Atomically persists the configuration: write to a temp file in the
    /// same directory, then rename into place, so a crash mid-write can never
    /// leave a corrupt config file on disk (§4.1).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        let path = path.as_ref();
        let serialized = toml::to_string_pretty(self).context("failed to serialize config")?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp_path = parent.to_path_buf();
        tmp_path.push(format!(
            ".{}.tmp",
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("config")
        ));

        std::fs::write(&tmp_path, serialized)
            .with_context(|| format!("failed to write temp config file '{}'", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename temp config file into '{}'", path.display()))?;
        info!("configuration saved to {}", path.display());
        Ok(())
    }
}

/// A live, watchable reference to the configuration. `save`-ing through this
/// handle updates every holder of a receiver, letting C3/C4 react to a
/// reload (e.g. toggling the proxy fleet on/off) without a restart.
#[derive(Clone)]
pub struct ConfigHandle {
    path: PathBuf,
    sender: watch::Sender<Config>,
}

impl ConfigHandle {
    pub fn new(path: impl Into<PathBuf>, config: Config) -> Self {
        let (sender, _) = watch::channel(config);
        Self {
            path: path.into(),
            sender,
        }
    }

    pub fn current(&self) -> Config {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.sender.subscribe()
    }

    /// Replaces the live config, persists it, and notifies subscribers.
    pub fn save(&self, new_config: Config) -> Result<()> {
        new_config.save(&self.path)?;
        self.sender.send_replace(new_config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips_structurally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetd.toml");

        let mut config = Config::default();
        config.host.name = "test-host".to_string();
        config.features.auto_scaling.enabled = true;
        config.features.auto_scaling.max = 16;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.host.name, config.host.name);
        assert_eq!(loaded.features.auto_scaling.max, config.features.auto_scaling.max);
        assert_eq!(loaded.max_start_at_once, config.max_start_at_once);
    }

    #[test]
    fn missing_file_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetd.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.host.manager_port, default_manager_port());
        assert_eq!(config.max_start_at_once, default_max_start_at_once());
    }

    #[test]
    fn rejects_zero_manager_port() {
        let mut config = Config::default();
        config.host.manager_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_auto_scaling_bounds() {
        let mut config = Config::default();
        config.features.auto_scaling.enabled = true;
        config.features.auto_scaling.min = 10;
        config.features.auto_scaling.max = 5;
        assert!(config.validate().is_err());
    }
}
