//! hutchd configuration: TOML file with section-by-section defaults,
//! overridable from the command line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub users: UsersConfig,
    pub supervisor: SupervisorConfig,
    pub transfers: TransferConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Private RPC bind address. Keep this off the public interface.
    pub rpc_addr: String,
    /// Public bind address for token-gated upload/download and health.
    pub public_addr: String,
    /// Externally visible base URL used when minting transfer URLs.
    pub public_base_url: String,
    /// State directory: tenant mapping, dev-mode homes.
    pub data_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rpc_addr: "127.0.0.1:7760".to_string(),
            public_addr: "0.0.0.0:7761".to_string(),
            public_base_url: "http://localhost:7761".to_string(),
            data_dir: "~/.local/share/hutch".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsersConfig {
    /// When false, everything runs as the current user with homes under
    /// `data_dir` (development mode). No privileged commands are issued.
    pub enabled: bool,
    /// Prefix applied to every generated OS username.
    pub prefix: String,
    /// First uid handed out to tenant accounts.
    pub uid_start: u32,
    /// Primary group for tenant accounts; must exist when set.
    pub group: Option<String>,
    pub shell: String,
    /// Use `sudo -n` for privileged commands instead of requiring root.
    pub use_sudo: bool,
    pub create_home: bool,
    /// SSH public keys installed into each new tenant home, when any.
    pub ssh_authorized_keys: Vec<String>,
    /// Shared git deploy key (path to the private key) copied into each
    /// new tenant home for workspace clones.
    pub ssh_deploy_key: Option<String>,
    /// Host pattern the deploy key is wired to in the tenant's ssh config.
    pub ssh_key_host: String,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: "hutch-".to_string(),
            uid_start: 20000,
            group: None,
            shell: "/bin/bash".to_string(),
            use_sudo: false,
            create_home: true,
            ssh_authorized_keys: Vec::new(),
            ssh_deploy_key: None,
            ssh_key_host: "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Worker executable; resolved via PATH when not absolute.
    pub worker_binary: String,
    /// Worker with no traffic for this long is marked idle, then reaped on
    /// the following sweep.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long to wait for a freshly spawned worker's socket + handshake.
    pub spawn_wait_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_binary: "hutch-worker".to_string(),
            idle_timeout_secs: 900,
            sweep_interval_secs: 60,
            spawn_wait_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Default token lifetime when the RPC caller does not pick one.
    pub default_expiry_minutes: u64,
    /// Hard ceiling on any upload, regardless of per-session limits.
    pub max_upload_mb: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            default_expiry_minutes: 15,
            max_upload_mb: 512,
            sweep_interval_secs: 60,
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = default_config_path();
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn data_dir(&self) -> PathBuf {
        expand(&self.server.data_dir)
    }
}

pub fn expand(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn default_config_path() -> PathBuf {
    expand("~/.config/hutch/hutchd.toml")
}
