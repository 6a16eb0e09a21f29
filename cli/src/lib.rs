//! Config discovery and event output for the `agentrun` binary.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use agentrun_core::Config;
use agentrun_core::ConfigToml;
use agentrun_orchestrator::OrchestratorEvent;
use anyhow::Context;
use async_channel::Receiver;
use tokio::task::JoinHandle;

/// Overrides the directory holding `config.toml` and the link store.
pub const HOME_ENV_VAR: &str = "AGENTRUN_HOME";
/// API token used when the config file does not carry one.
pub const API_TOKEN_ENV_VAR: &str = "AGENTRUN_API_TOKEN";

const CONFIG_FILE: &str = "config.toml";
const LINK_STORE_FILE: &str = "links.json";

/// `$AGENTRUN_HOME`, else `~/.agentrun`.
pub fn find_agentrun_home() -> anyhow::Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV_VAR).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".agentrun"))
}

/// Loads the config from `explicit`, or from the home directory when no
/// path is given. Only an explicit path has to exist.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let home = find_agentrun_home()?;
    let token = std::env::var(API_TOKEN_ENV_VAR).ok();
    match explicit {
        Some(path) => load_config_from(path, true, token, &home),
        None => load_config_from(&home.join(CONFIG_FILE), false, token, &home),
    }
}

/// Reads `path` and fills the API token and link store from the
/// environment and `home` when the file leaves them unset.
pub fn load_config_from(
    path: &Path,
    required: bool,
    env_token: Option<String>,
    home: &Path,
) -> anyhow::Result<Config> {
    let mut cfg = match std::fs::read_to_string(path) {
        Ok(contents) => ConfigToml::from_toml_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            ConfigToml::default()
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    if cfg.api_token.is_none() {
        cfg.api_token = env_token.filter(|token| !token.trim().is_empty());
    }
    if cfg.link_store.is_none() {
        cfg.link_store = Some(home.join(LINK_STORE_FILE));
    }

    Config::try_from(cfg).with_context(|| format!("invalid configuration in {}", path.display()))
}

/// Writes every event from `rx` to `out` as one JSON line. The task ends,
/// handing `out` back, once every emitter feeding `rx` is dropped and the
/// queue is drained.
pub fn spawn_event_writer<W>(rx: Receiver<OrchestratorEvent>, mut out: W) -> JoinHandle<W>
where
    W: Write + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let written = serde_json::to_string(&event)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(out, "{line}"));
            if let Err(err) = written {
                tracing::warn!(error = %err, "failed to write orchestrator event");
            }
        }
        out
    })
}
