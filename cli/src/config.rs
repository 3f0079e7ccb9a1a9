//! Configuration layering: CLI flags and env vars win over the optional
//! `config.toml`, which wins over built-in defaults.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Deserialize;

use moor_shared::container::is_docker_available;
use moor_shared::models::sandbox::ProviderType;

pub const DEFAULT_PORT: u16 = 7171;
pub const DEFAULT_CONTAINER_IMAGE: &str = "ghcr.io/moor-dev/agent:latest";

#[derive(Debug, Clone, Args)]
pub struct ServeFlags {
    /// Address to bind.
    #[arg(long, env = "MOOR_HOST")]
    pub host: Option<String>,

    /// Port to listen on.
    #[arg(long, env = "MOOR_PORT")]
    pub port: Option<u16>,

    /// Sandbox provider: mock, container, or microvm.
    #[arg(long, env = "SANDBOX_PROVIDER")]
    pub provider: Option<String>,

    /// State directory (database, per-session mounts, logs).
    #[arg(long, env = "MOOR_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Agent container image.
    #[arg(long, env = "MOOR_AGENT_IMAGE")]
    pub image: Option<String>,

    /// 64-char hex key for the secrets store.
    #[arg(long, env = "RELAY_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,
}

/// Optional `config.toml` in the config directory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub provider: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub image: Option<String>,
    pub microvm_command: Option<Vec<String>>,
    pub retention_days: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub provider: ProviderType,
    pub state_dir: PathBuf,
    pub image: String,
    pub microvm_command: Option<Vec<String>>,
    pub encryption_key: String,
    pub retention_days: u64,
}

impl Config {
    pub fn load(flags: &ServeFlags) -> Result<Self> {
        let file = load_file_config()?;

        let state_dir = flags
            .state_dir
            .clone()
            .or_else(|| file.state_dir.clone())
            .or_else(default_state_dir)
            .context("cannot determine a state directory; pass --state-dir")?;

        let provider_name = flags.provider.clone().or_else(|| file.provider.clone());
        let provider = match provider_name.as_deref() {
            Some(name) => ProviderType::from_str(name)
                .map_err(|error| anyhow::anyhow!("{error} (expected mock, container, or microvm)"))?,
            None => default_provider(),
        };

        let Some(encryption_key) = flags.encryption_key.clone() else {
            bail!("RELAY_ENCRYPTION_KEY is required (64 hex characters)");
        };

        Ok(Self {
            host: flags
                .host
                .clone()
                .or(file.host)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: flags.port.or(file.port).unwrap_or(DEFAULT_PORT),
            provider,
            state_dir,
            image: flags
                .image
                .clone()
                .or(file.image)
                .unwrap_or_else(|| DEFAULT_CONTAINER_IMAGE.to_string()),
            microvm_command: file.microvm_command,
            encryption_key,
            retention_days: file.retention_days.unwrap_or(7),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("relay.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}

fn load_file_config() -> Result<FileConfig> {
    let Some(path) = dirs::config_dir().map(|dir| dir.join("moor").join("config.toml")) else {
        return Ok(FileConfig::default());
    };
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

fn default_state_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("moor"))
}

/// Container when the docker daemon answers, mock otherwise.
fn default_provider() -> ProviderType {
    if is_docker_available() {
        ProviderType::Container
    } else {
        ProviderType::Mock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_with_key() -> ServeFlags {
        ServeFlags {
            host: None,
            port: None,
            provider: Some("mock".to_string()),
            state_dir: Some(PathBuf::from("/tmp/moor-test")),
            image: None,
            encryption_key: Some("ab".repeat(32)),
        }
    }

    #[test]
    fn defaults_fill_in() {
        let config = Config::load(&flags_with_key()).expect("load");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.provider, ProviderType::Mock);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/moor-test/relay.db"));
    }

    #[test]
    fn missing_key_is_fatal() {
        let mut flags = flags_with_key();
        flags.encryption_key = None;
        assert!(Config::load(&flags).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let mut flags = flags_with_key();
        flags.provider = Some("firecracker".to_string());
        assert!(Config::load(&flags).is_err());
    }
}
