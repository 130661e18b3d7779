//! Command line control for keymapperd
//! Usage: keymapper-control --command start --device "Foo Device" --preset bar

use clap::Parser;
use keymapper_common::ipc_client::{IpcClient, DEFAULT_SOCKET_PATH};
use keymapper_common::tracing;
use keymapperd::config::ConfigManager;
use keymapperd::control::{self, ControlError, Dispatcher, Options, ProcessLauncher, RemoteDaemon};
use keymapperd::groups::{DeviceRegistry, EvdevScanner};
use keymapperd::preset;
use tracing::{debug, error};

#[tokio::main]
async fn main() {
    let options = Options::parse();

    tracing_subscriber::fmt()
        .with_max_level(if options.debug { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .with_target(false)
        .init();

    if let Err(e) = run(options).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(options: Options) -> Result<(), ControlError> {
    if options.list_devices {
        let registry = DeviceRegistry::with_scanner(Box::new(EvdevScanner::new()));
        for group in registry.groups() {
            println!("{}", group.key);
            for path in &group.paths {
                println!("    {}", path.display());
            }
        }
        return Ok(());
    }

    if options.key_names {
        for name in preset::key_names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let command = options.command.ok_or(ControlError::MissingArgument("command"))?;
    if command.is_internal() {
        return control::internals(&options, &ProcessLauncher);
    }

    let root = ConfigManager::default_root();
    let config = match ConfigManager::load(&root).await {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            ConfigManager::new(&root)
        }
    };
    let registry = DeviceRegistry::with_scanner(Box::new(EvdevScanner::new()));
    debug!("Found {} device groups", registry.groups().len());

    let socket = options
        .socket
        .clone()
        .unwrap_or_else(|| DEFAULT_SOCKET_PATH.into());
    let mut daemon = RemoteDaemon::new(IpcClient::with_socket_path(socket));

    Dispatcher::new(registry, config)
        .communicate(&options, &mut daemon)
        .await
}
