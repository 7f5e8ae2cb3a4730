// src/core/supervisor/argv.rs

//! Builds the argv/env/cwd triple for launching one instance's game-server
//! child process (§4.3).

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::Config;
use crate::core::registry::Instance;

/// Everything [`tokio::process::Command`] needs to launch a child.
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
    pub cwd: PathBuf,
}

/// Derives the per-instance game/voice ports from the host's configured base
/// ports: `port_i = base + (id - 1)`, with proxy instances additionally
/// publishing on `base + 10000 + (id - 1)` (§4.1, §4.4).
pub fn derive_ports(config: &Config, id: u32) -> (u16, u16, u16) {
    let offset = (id - 1) as u16;
    let game_port = config.host.base_game_port + offset;
    let voice_port = config.host.base_voice_port + offset;
    let public_port = if config.features.proxy_enabled {
        game_port + 10_000
    } else {
        game_port
    };
    (game_port, voice_port, public_port)
}

/// Builds the launch plan for an instance. The binary name and most flags are
/// fixed by the host game; the only per-instance variation is ports, the mod
/// tag, and whether the console is suppressed.
pub fn build(config: &Config, instance: &Instance) -> LaunchPlan {
    let mod_tag = format!("instance{}", instance.id);

    let mut args = vec![
        "-dedicated".to_string(),
        "-noconfig".to_string(),
        format!(
            "-execute \"Set GamePort {}; Set VoicePort {};\"",
            instance.game_port, instance.voice_port
        ),
        format!("-mod game;{mod_tag}"),
        "-register".to_string(),
        format!("127.0.0.1:{}", config.host.manager_port),
    ];
    if config.host.suppress_console {
        args.push("-noconsole".to_string());
    }
    if !config.master.master_url.is_empty() {
        args.push("-masterserver".to_string());
        args.push(config.master.master_url.clone());
    }

    let mut envs = HashMap::new();
    #[cfg(target_os = "windows")]
    {
        envs.insert(
            "USERPROFILE".to_string(),
            config.host.home_dir.to_string_lossy().into_owned(),
        );
        envs.insert(
            "APPDATA".to_string(),
            config.host.home_dir.join("AppData").to_string_lossy().into_owned(),
        );
    }
    #[cfg(not(target_os = "windows"))]
    {
        envs.insert(
            "HOME".to_string(),
            config.host.home_dir.to_string_lossy().into_owned(),
        );
        let lib_dir = config.host.install_dir.join("libs-x86_64");
        let prepended = match std::env::var_os("LD_LIBRARY_PATH") {
            Some(existing) if !existing.is_empty() => {
                format!("{}:{}", lib_dir.display(), existing.to_string_lossy())
            }
            _ => lib_dir.to_string_lossy().into_owned(),
        };
        envs.insert("LD_LIBRARY_PATH".to_string(), prepended);
    }

    LaunchPlan {
        program: config.host.install_dir.join(executable_name()),
        args,
        envs,
        cwd: config.host.install_dir.clone(),
    }
}

#[cfg(target_os = "windows")]
fn executable_name() -> &'static str {
    "game-server.exe"
}

#[cfg(not(target_os = "windows"))]
fn executable_name() -> &'static str {
    "game-server"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_ports_offsets_from_instance_id() {
        let mut config = Config::default();
        config.host.base_game_port = 7900;
        config.host.base_voice_port = 7950;

        let (game, voice, public) = derive_ports(&config, 1);
        assert_eq!((game, voice, public), (7900, 7950, 7900));

        let (game, voice, public) = derive_ports(&config, 3);
        assert_eq!((game, voice, public), (7902, 7952, 7902));
    }

    #[test]
    fn proxy_enabled_adds_ten_thousand_to_public_port() {
        let mut config = Config::default();
        config.host.base_game_port = 7900;
        config.features.proxy_enabled = true;

        let (game, _voice, public) = derive_ports(&config, 1);
        assert_eq!(game, 7900);
        assert_eq!(public, 17900);
    }

    #[test]
    fn build_includes_register_flag_with_manager_port() {
        let mut config = Config::default();
        config.host.manager_port = 8123;
        let instance = Instance::new(1, 7900, 7950, Some(8123));

        let plan = build(&config, &instance);
        assert!(plan.args.contains(&"-register".to_string()));
        assert!(plan.args.iter().any(|a| a == "127.0.0.1:8123"));
    }

    #[test]
    fn build_adds_noconsole_only_when_configured() {
        let mut config = Config::default();
        config.host.suppress_console = true;
        let instance = Instance::new(1, 7900, 7950, None);

        let plan = build(&config, &instance);
        assert!(plan.args.contains(&"-noconsole".to_string()));
    }
}
