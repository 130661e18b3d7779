use keymapper_common::ipc_client::{read_frame, write_frame, IpcError};
use keymapper_common::{tracing, Request, Response};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::net::{UnixListener, UnixStream};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::control::SERVICE_BIN;
use crate::security;
use crate::SharedDaemon;

/// IPC server for keymapper-control and other clients
pub struct IpcServer {
    socket_path: PathBuf,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl IpcServer {
    /// Create a new IPC server with the specified socket path
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Result<Self, std::io::Error> {
        let path = socket_path.as_ref().to_path_buf();

        // Remove any existing socket file
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self {
            socket_path: path,
            shutdown_tx: None,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and serve `daemon` until shutdown
    pub async fn start(&mut self, daemon: SharedDaemon) -> Result<(), std::io::Error> {
        info!("Starting IPC server at {}", self.socket_path.display());

        let listener = UnixListener::bind(&self.socket_path)?;

        if let Err(e) = security::set_socket_permissions(&self.socket_path) {
            warn!("Failed to set socket permissions: {}", e);
        }

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        let started = Instant::now();

        task::spawn(async move {
            loop {
                tokio::select! {
                    connection = listener.accept() => {
                        match connection {
                            Ok((stream, _)) => {
                                debug!("New client connected");
                                let daemon = SharedDaemon::clone(&daemon);
                                task::spawn(async move {
                                    if let Err(e) = handle_client(stream, daemon, started).await {
                                        error!("Error handling client: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Error accepting connection: {}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("IPC server loop stopped");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Shutdown the IPC server
    pub async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        info!("Shutting down IPC server");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        Ok(())
    }
}

/// Answer one request on a client connection
pub async fn handle_client(mut stream: UnixStream, daemon: SharedDaemon, started: Instant) -> Result<(), IpcError> {
    let request: Request = read_frame(&mut stream).await?;
    debug!("Received request: {:?}", request);

    let response = handle_request(request, &daemon, started).await;
    debug!("Sending response: {:?}", response);

    write_frame(&mut stream, &response).await
}

/// Apply a request to the daemon
pub async fn handle_request(request: Request, daemon: &SharedDaemon, started: Instant) -> Response {
    let mut daemon = daemon.lock().await;

    match request {
        Request::Hello => Response::Hello(SERVICE_BIN.to_string()),
        Request::StartInjecting { device, preset } => {
            match daemon.start_injecting(&device, &preset).await {
                Ok(()) => Response::Ack,
                Err(e) => {
                    error!("Failed to start injecting into {}: {}", device, e);
                    Response::Error(e.to_string())
                }
            }
        }
        Request::StopInjecting { device } => {
            daemon.stop_injecting(&device);
            Response::Ack
        }
        Request::StopAll => {
            daemon.stop_all();
            Response::Ack
        }
        Request::Autoload => {
            daemon.autoload().await;
            Response::Ack
        }
        Request::AutoloadSingle { device } => {
            daemon.autoload_single(&device).await;
            Response::Ack
        }
        Request::SetConfigDir { path } => {
            daemon.set_config_dir(&path).await;
            Response::Ack
        }
        Request::GetStatus => {
            daemon.reap_finished();
            Response::Status {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_seconds: started.elapsed().as_secs(),
                injecting: daemon.running(),
            }
        }
    }
}
