//! Keymapper Daemon - Main Entry Point
//!
//! This is the privileged system daemon responsible for:
//! - Grabbing input devices and injecting remapped events
//! - Autoloading configured presets
//! - IPC communication with keymapper-control

use clap::Parser;
use keymapper_common::ipc_client::DEFAULT_SOCKET_PATH;
use keymapper_common::tracing;
use keymapperd::config::ConfigManager;
use keymapperd::groups::{DeviceRegistry, EvdevScanner};
use keymapperd::injector::EvdevInjectorFactory;
use keymapperd::{ipc, security, Daemon};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keymapperd", version, about = "Keymapper injection daemon")]
struct Args {
    /// Debug logging
    #[arg(short, long)]
    debug: bool,

    /// Read presets and config.yaml from this directory
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Socket to listen on
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Start the configured presets right away
    #[arg(long)]
    autoload: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.debug { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .with_target(false)
        .init();

    info!("Starting keymapperd v{}", env!("CARGO_PKG_VERSION"));

    if !security::is_root() {
        warn!("Not running as root, grabbing devices will probably fail");
    }

    let root = args.config_dir.clone().unwrap_or_else(ConfigManager::default_root);
    let config = ConfigManager::load(&root).await?;

    let registry = DeviceRegistry::with_scanner(Box::new(EvdevScanner::new()));

    let daemon = keymapperd::shared(Daemon::new(config, registry, Arc::new(EvdevInjectorFactory::new())));

    if args.autoload {
        daemon.lock().await.autoload().await;
    }

    let mut ipc_server = ipc::IpcServer::new(&args.socket)?;
    ipc_server.start(Arc::clone(&daemon)).await?;
    info!("IPC server started successfully");

    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = interrupt.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    // release all grabbed devices before the socket goes away
    daemon.lock().await.stop_all();

    if let Err(e) = ipc_server.shutdown().await {
        error!("Error during IPC server shutdown: {}", e);
    }
    info!("keymapperd shutdown complete");
    Ok(())
}
