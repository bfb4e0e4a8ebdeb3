use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hutchd::api::{AppState, public_router, rpc_router};
use hutchd::config::AppConfig;
use hutchd::launcher::{SameUserLauncher, TenantUserLauncher, WorkerLauncher};
use hutchd::registry::Registry;
use hutchd::supervisor::Supervisor;
use hutchd::transfer::TransferBroker;

#[derive(Parser, Debug)]
#[command(name = "hutchd")]
#[command(about = "Multi-tenant execution environment supervisor")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Private RPC bind address (overrides config)
    #[arg(long)]
    rpc_addr: Option<String>,

    /// Public bind address for transfers and health (overrides config)
    #[arg(long)]
    public_addr: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "hutchd=debug,tower_http=debug"
    } else {
        "hutchd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.rpc_addr {
        config.server.rpc_addr = addr;
    }
    if let Some(addr) = args.public_addr {
        config.server.public_addr = addr;
    }

    let data_dir = config.data_dir();
    let registry = Arc::new(Registry::open(config.users.clone(), data_dir)?);
    registry.restore_all().await;

    let launcher: Box<dyn WorkerLauncher> = if config.users.enabled {
        Box::new(TenantUserLauncher {
            worker_binary: config.supervisor.worker_binary.clone(),
            use_sudo: config.users.use_sudo,
        })
    } else {
        Box::new(SameUserLauncher {
            worker_binary: config.supervisor.worker_binary.clone(),
        })
    };
    let supervisor = Supervisor::new(
        Arc::clone(&registry),
        launcher,
        config.supervisor.clone(),
    );
    let broker = TransferBroker::new(
        config.transfers.clone(),
        Arc::clone(&registry),
        config.server.public_base_url.clone(),
    );

    tokio::spawn(Arc::clone(&supervisor).run_sweeper());
    tokio::spawn(Arc::clone(&broker).run_sweeper());

    let state = AppState {
        supervisor: Arc::clone(&supervisor),
        registry,
        broker,
    };

    let rpc_listener = tokio::net::TcpListener::bind(&config.server.rpc_addr)
        .await
        .with_context(|| format!("failed to bind rpc address {}", config.server.rpc_addr))?;
    let public_listener = tokio::net::TcpListener::bind(&config.server.public_addr)
        .await
        .with_context(|| format!("failed to bind public address {}", config.server.public_addr))?;
    info!(
        rpc = config.server.rpc_addr,
        public = config.server.public_addr,
        privilege_separation = config.users.enabled,
        "hutchd listening"
    );

    let rpc_server = axum::serve(rpc_listener, rpc_router(state.clone())).into_future();
    let public_server = axum::serve(public_listener, public_router(state)).into_future();

    tokio::select! {
        result = rpc_server => result.context("rpc server failed")?,
        result = public_server => result.context("public server failed")?,
        _ = shutdown_signal() => {}
    }

    info!("shutting down, stopping workers");
    supervisor.shutdown_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
