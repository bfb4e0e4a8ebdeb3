//! hutch-worker entry point.
//!
//! Runs as the tenant's own OS user. Normally spawned by hutchd with the
//! socket path on the command line; can also be run standalone for
//! development.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use serde::Deserialize;

use hutch_worker::{TerminalConfig, TerminalManager, WorkerState, WorkspaceStore};

#[derive(Parser, Debug)]
#[command(name = "hutch-worker")]
#[command(about = "Per-tenant terminal and workspace daemon")]
#[command(version)]
struct Args {
    /// Unix socket to listen on
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Directory containing this tenant's workspaces
    #[arg(short, long)]
    workspaces_dir: Option<PathBuf>,

    /// Worker state directory (markers, scratch)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Output settle window in milliseconds
    #[arg(long)]
    settle_ms: Option<u64>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    worker: WorkerSection,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerSection {
    #[serde(default)]
    socket: Option<String>,
    #[serde(default)]
    workspaces_dir: Option<String>,
    #[serde(default)]
    state_dir: Option<String>,
    #[serde(default)]
    settle_ms: Option<u64>,
    #[serde(default)]
    shell: Option<String>,
}

fn load_config(path: Option<&Path>, home: &Path) -> Result<ConfigFile> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let default = home.join(".config").join("hutch").join("config.toml");
            if !default.exists() {
                return Ok(ConfigFile::default());
            }
            default
        }
    };
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
}

fn expand_path(raw: &str, home: &Path) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(raw),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    let home = PathBuf::from(std::env::var("HOME").context("HOME is not set")?);
    let config = load_config(args.config.as_deref(), &home)?;

    let socket = hutch_worker::socket_path_or_default(
        args.socket
            .or_else(|| config.worker.socket.as_deref().map(|s| expand_path(s, &home))),
        &home,
    );
    let workspaces_dir = args
        .workspaces_dir
        .or_else(|| {
            config
                .worker
                .workspaces_dir
                .as_deref()
                .map(|s| expand_path(s, &home))
        })
        .unwrap_or_else(|| home.join("workspaces"));
    let state_dir = args
        .state_dir
        .or_else(|| config.worker.state_dir.as_deref().map(|s| expand_path(s, &home)))
        .unwrap_or_else(|| home.join(".hutch"));

    let mut terminal_cfg = TerminalConfig::new(workspaces_dir.clone(), state_dir);
    if let Some(settle) = args.settle_ms.or(config.worker.settle_ms) {
        terminal_cfg.settle_ms = settle;
    }
    if let Some(shell) = config.worker.shell {
        terminal_cfg.shell = shell;
    }

    info!(
        "starting hutch-worker: socket={} workspaces={}",
        socket.display(),
        workspaces_dir.display()
    );

    let state = WorkerState::new(
        TerminalManager::new(terminal_cfg),
        WorkspaceStore::new(workspaces_dir),
    );
    hutch_worker::run(state, &socket).await
}
