//! ipctl daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::oneshot;

mod access;
mod api;
mod command;
mod config;
mod coordinator;
mod dns;
mod error;
mod health;
mod installer;
mod peer;
mod policy;
mod route_store;
mod rpc;
mod types;

use api::run_rpc_server;
use command::SystemRunner;
use config::{Config, DEFAULT_CONFIG_PATH, EXAMPLE_CONFIG};
use coordinator::Coordinator;
use dns::SystemResolver;
use peer::HttpPeerClient;

/// Manages IP announcements for hosted containers.
#[derive(Debug, Parser)]
#[command(name = "ipctl", version)]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print an example configuration and exit.
    #[arg(long)]
    example_config: bool,

    /// Discard persisted route state and start with nothing announced.
    #[arg(short, long)]
    revert: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();
    let args = Args::parse();

    if args.example_config {
        print!("{}", EXAMPLE_CONFIG);
        return Ok(());
    }

    // Missing bind address or unreadable configuration is fatal here only.
    let cfg = Config::load(&args.config)?;
    let bind_addr = cfg.bind_addr()?;
    info!("Starting ipctl with config from {}", args.config.display());

    let resolver = Arc::new(SystemResolver::from_system_conf()?);
    let peers = Arc::new(HttpPeerClient::new(
        bind_addr.ip(),
        cfg.bind_port,
        cfg.peer_timeout(),
    )?);
    let coordinator = Arc::new(
        Coordinator::start(&cfg, args.revert, resolver, peers, Arc::new(SystemRunner)).await?,
    );

    // RPC Server
    let listener = TcpListener::bind(bind_addr).await?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let served = Arc::clone(&coordinator);
    let server_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop_rx.await;
        };
        if let Err(e) = run_rpc_server(listener, served, shutdown).await {
            error!("RPC server failed: {}", e);
        }
    });

    // Reconfiguration and shutdown signals
    let mut hangup = unix_signal(SignalKind::hangup())?;
    let mut terminate = unix_signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match Config::load(&args.config) {
                    Ok(cfg) => {
                        if let Err(e) = coordinator.configure(&cfg).await {
                            error!("Reconfiguration failed, keeping previous configuration: {}", e);
                        }
                    }
                    Err(e) => error!("Keeping previous configuration: {}", e),
                }
            }
            res = signal::ctrl_c() => {
                match res {
                    Ok(()) => info!("Received Ctrl+C, shutting down..."),
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                }
                break;
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
        }
    }

    let _ = stop_tx.send(());
    if let Err(e) = server_handle.await {
        error!("RPC server task failed: {}", e);
    }
    coordinator.shutdown().await;

    info!("Shutdown complete.");
    Ok(())
}
