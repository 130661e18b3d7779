//! keymapper-control commands
//!
//! Turns a command plus its arguments into daemon calls. Device arguments
//! are resolved here, so the daemon only ever sees canonical keys.

use keymapper_common::ipc_client::{IpcClient, IpcError};
use keymapper_common::{tracing, DeviceKey, PresetId, Request, Response};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ConfigManager;
use crate::daemon::Daemon;
use crate::groups::DeviceRegistry;

/// Program started by the `helper` command
pub const HELPER_BIN: &str = "keymapper-helper";

/// Program started by the `start-daemon` command
pub const SERVICE_BIN: &str = "keymapperd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Command {
    Start,
    Stop,
    StopAll,
    Autoload,
    Hello,
    Helper,
    StartDaemon,
}

impl Command {
    /// Commands that launch a process instead of talking to the daemon
    pub fn is_internal(self) -> bool {
        matches!(self, Command::Helper | Command::StartDaemon)
    }
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "keymapper-control", version, about = "Control the keymapper daemon")]
pub struct Options {
    /// What to do
    #[arg(short, long, value_enum)]
    pub command: Option<Command>,

    /// Read presets and config.yaml from this directory
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Preset name, for start
    #[arg(short, long)]
    pub preset: Option<String>,

    /// Device key, name or event node path
    #[arg(long)]
    pub device: Option<String>,

    /// Print the known device groups and exit
    #[arg(short, long)]
    pub list_devices: bool,

    /// Print the key names usable in presets and exit
    #[arg(short, long)]
    pub key_names: bool,

    /// Debug logging, also passed on to start-daemon
    #[arg(short, long)]
    pub debug: bool,

    /// Socket of the daemon
    #[arg(long)]
    pub socket: Option<PathBuf>,
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("device \"{0}\" is unknown or not an appropriate input device")]
    UnknownDevice(String),
    #[error("preset \"{preset}\" not found at {}", .path.display())]
    MissingPreset { preset: String, path: PathBuf },
    #[error("--{0} is required for this command")]
    MissingArgument(&'static str),
    #[error("daemon error: {0}")]
    Daemon(String),
    #[error("unexpected response from daemon: {0}")]
    UnexpectedResponse(String),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("failed to launch {0}: {1}")]
    Launch(String, std::io::Error),
}

/// What the dispatcher needs from a daemon, local or behind the socket
#[async_trait::async_trait]
pub trait DaemonControl: Send {
    async fn hello(&mut self) -> Result<String, ControlError>;
    async fn set_config_dir(&mut self, dir: &Path) -> Result<(), ControlError>;
    async fn start_injecting(&mut self, device: &DeviceKey, preset: &PresetId) -> Result<(), ControlError>;
    async fn stop_injecting(&mut self, device: &DeviceKey) -> Result<(), ControlError>;
    async fn stop_all(&mut self) -> Result<(), ControlError>;
    async fn autoload(&mut self, device: Option<&DeviceKey>) -> Result<(), ControlError>;
}

#[async_trait::async_trait]
impl DaemonControl for Daemon {
    async fn hello(&mut self) -> Result<String, ControlError> {
        Ok(SERVICE_BIN.to_string())
    }

    async fn set_config_dir(&mut self, dir: &Path) -> Result<(), ControlError> {
        Daemon::set_config_dir(self, dir).await;
        Ok(())
    }

    async fn start_injecting(&mut self, device: &DeviceKey, preset: &PresetId) -> Result<(), ControlError> {
        Daemon::start_injecting(self, device, preset)
            .await
            .map_err(|e| ControlError::Daemon(e.to_string()))
    }

    async fn stop_injecting(&mut self, device: &DeviceKey) -> Result<(), ControlError> {
        Daemon::stop_injecting(self, device);
        Ok(())
    }

    async fn stop_all(&mut self) -> Result<(), ControlError> {
        Daemon::stop_all(self);
        Ok(())
    }

    async fn autoload(&mut self, device: Option<&DeviceKey>) -> Result<(), ControlError> {
        match device {
            Some(device) => self.autoload_single(device).await,
            None => Daemon::autoload(self).await,
        }
        Ok(())
    }
}

/// A daemon reached through its socket
pub struct RemoteDaemon {
    client: IpcClient,
}

impl RemoteDaemon {
    pub fn new(client: IpcClient) -> Self {
        Self { client }
    }

    async fn call(&self, request: Request) -> Result<Response, ControlError> {
        debug!("Sending {:?}", request);
        match self.client.send(&request).await? {
            Response::Error(message) => Err(ControlError::Daemon(message)),
            response => Ok(response),
        }
    }

    async fn ack(&self, request: Request) -> Result<(), ControlError> {
        match self.call(request).await? {
            Response::Ack => Ok(()),
            other => Err(ControlError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
}

#[async_trait::async_trait]
impl DaemonControl for RemoteDaemon {
    async fn hello(&mut self) -> Result<String, ControlError> {
        match self.call(Request::Hello).await? {
            Response::Hello(name) => Ok(name),
            other => Err(ControlError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    async fn set_config_dir(&mut self, dir: &Path) -> Result<(), ControlError> {
        self.ack(Request::SetConfigDir { path: dir.to_path_buf() }).await
    }

    async fn start_injecting(&mut self, device: &DeviceKey, preset: &PresetId) -> Result<(), ControlError> {
        self.ack(Request::StartInjecting {
            device: device.clone(),
            preset: preset.clone(),
        })
        .await
    }

    async fn stop_injecting(&mut self, device: &DeviceKey) -> Result<(), ControlError> {
        self.ack(Request::StopInjecting { device: device.clone() }).await
    }

    async fn stop_all(&mut self) -> Result<(), ControlError> {
        self.ack(Request::StopAll).await
    }

    async fn autoload(&mut self, device: Option<&DeviceKey>) -> Result<(), ControlError> {
        match device {
            Some(device) => self.ack(Request::AutoloadSingle { device: device.clone() }).await,
            None => self.ack(Request::Autoload).await,
        }
    }
}

/// Starts the helper and service programs
pub trait Launcher {
    fn launch(&self, program: &str, args: &[&str]) -> std::io::Result<()>;
}

/// Spawns programs in the background
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, program: &str, args: &[&str]) -> std::io::Result<()> {
        info!("Starting {} {}", program, args.join(" "));
        std::process::Command::new(program).args(args).spawn()?;
        Ok(())
    }
}

/// Runs `helper` and `start-daemon`. Other commands are ignored.
pub fn internals(options: &Options, launcher: &dyn Launcher) -> Result<(), ControlError> {
    let (program, args): (&str, Vec<&str>) = match options.command {
        Some(Command::Helper) => (HELPER_BIN, Vec::new()),
        Some(Command::StartDaemon) if options.debug => (SERVICE_BIN, vec!["-d"]),
        Some(Command::StartDaemon) => (SERVICE_BIN, Vec::new()),
        _ => return Ok(()),
    };

    launcher
        .launch(program, &args)
        .map_err(|e| ControlError::Launch(program.to_string(), e))
}

/// Resolves arguments and forwards commands to a daemon
pub struct Dispatcher {
    registry: DeviceRegistry,
    config: ConfigManager,
}

impl Dispatcher {
    pub fn new(registry: DeviceRegistry, config: ConfigManager) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    fn require_device(&self, options: &Options) -> Result<DeviceKey, ControlError> {
        let device = options
            .device
            .as_deref()
            .ok_or(ControlError::MissingArgument("device"))?;
        self.registry
            .find(device)
            .map(|group| group.key.clone())
            .ok_or_else(|| ControlError::UnknownDevice(device.to_string()))
    }

    /// Check everything a command needs before calling into the daemon
    fn prepare(&self, command: Command, options: &Options) -> Result<Prepared, ControlError> {
        Ok(match command {
            Command::Start => {
                let device = self.require_device(options)?;
                let preset = PresetId::new(
                    options
                        .preset
                        .as_deref()
                        .ok_or(ControlError::MissingArgument("preset"))?,
                );
                let group = self
                    .registry
                    .find_key(&device)
                    .ok_or_else(|| ControlError::UnknownDevice(device.to_string()))?;
                let path = self.config.preset_path(&group.name, &preset);
                if !path.exists() {
                    return Err(ControlError::MissingPreset {
                        preset: preset.to_string(),
                        path,
                    });
                }
                Prepared::Start(device, preset)
            }
            Command::Stop => Prepared::Stop(self.require_device(options)?),
            Command::StopAll => Prepared::StopAll,
            Command::Autoload => match options.device {
                Some(_) => Prepared::Autoload(Some(self.require_device(options)?)),
                None => Prepared::Autoload(None),
            },
            Command::Hello => Prepared::Hello,
            Command::Helper | Command::StartDaemon => Prepared::Nothing,
        })
    }

    /// Run one command against `daemon`.
    ///
    /// An error means the command could not be carried out and the caller
    /// should exit non-zero. Nothing reaches the daemon when a device or
    /// preset argument doesn't resolve.
    pub async fn communicate<D>(&mut self, options: &Options, daemon: &mut D) -> Result<(), ControlError>
    where
        D: DaemonControl + ?Sized,
    {
        let Some(command) = options.command else {
            return Ok(());
        };

        if let Some(dir) = &options.config_dir {
            self.config.set_config_dir(dir).await;
        }

        let prepared = self.prepare(command, options)?;
        if matches!(prepared, Prepared::Nothing) {
            return Ok(());
        }

        if !matches!(prepared, Prepared::Hello) {
            daemon.set_config_dir(self.config.root()).await?;
        }

        match prepared {
            Prepared::Start(device, preset) => {
                info!("Starting injection: {} {}", device, preset);
                daemon.start_injecting(&device, &preset).await
            }
            Prepared::Stop(device) => daemon.stop_injecting(&device).await,
            Prepared::StopAll => daemon.stop_all().await,
            Prepared::Autoload(device) => daemon.autoload(device.as_ref()).await,
            Prepared::Hello => {
                let name = daemon.hello().await?;
                info!("Daemon answered: {}", name);
                Ok(())
            }
            Prepared::Nothing => Ok(()),
        }
    }
}

enum Prepared {
    Start(DeviceKey, PresetId),
    Stop(DeviceKey),
    StopAll,
    Autoload(Option<DeviceKey>),
    Hello,
    Nothing,
}
