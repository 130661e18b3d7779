//! IPC client for talking to keymapperd
//!
//! Requests are bincode-encoded and framed with a 4 byte little endian length
//! prefix, both ways. Every request opens a fresh connection.

use crate::{Request, Response};
use serde::{de::DeserializeOwned, Serialize};

use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

/// Errors that can occur during IPC communication
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Operation timeout after {0}ms")]
    OperationTimeout(u64),

    #[error("Daemon not running at {0}")]
    DaemonNotRunning(String),

    #[error("Message too large: {0} bytes exceeds maximum of {1} bytes")]
    MessageTooLarge(usize, usize),
}

/// Default socket path for the keymapper daemon
pub const DEFAULT_SOCKET_PATH: &str = "/run/keymapper/keymapper.sock";

/// Default timeout for operations (in milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum message size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum number of reconnection attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay between reconnection attempts (in milliseconds)
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// IPC client with connection management and error handling
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: String,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcClient {
    /// Create a new IPC client with default settings
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }

    /// Create a new IPC client with a custom socket path
    pub fn with_socket_path<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }

    /// Set the timeout for operations
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    /// Set reconnection parameters
    pub fn with_retry_params(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = Duration::from_millis(retry_delay_ms);
        self
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Check if the daemon is running by attempting to connect to its socket
    pub async fn is_daemon_running(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    /// Connect to the daemon with retry logic
    pub async fn connect(&self) -> Result<UnixStream, IpcError> {
        let mut attempts = 0;

        loop {
            match timeout(self.timeout, UnixStream::connect(&self.socket_path)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    if attempts >= self.max_retries {
                        return Err(IpcError::DaemonNotRunning(self.socket_path.clone()));
                    }
                    tracing::warn!("Connection attempt {} failed: {}, retrying...", attempts + 1, e);
                    tokio::time::sleep(self.retry_delay).await;
                    attempts += 1;
                }
                Err(_) => return Err(IpcError::ConnectionTimeout),
            }
        }
    }

    /// Send a request to the daemon and wait for its response.
    ///
    /// Only the connection attempt is retried. A request that reached the
    /// daemon is never sent twice, since lifecycle requests are not
    /// idempotent from the caller's point of view.
    pub async fn send(&self, request: &Request) -> Result<Response, IpcError> {
        let mut stream = self.connect().await?;
        self.send_with_stream(&mut stream, request).await
    }

    async fn send_with_stream(&self, stream: &mut UnixStream, request: &Request) -> Result<Response, IpcError> {
        let millis = self.timeout.as_millis() as u64;

        match timeout(self.timeout, write_frame(stream, request)).await {
            Ok(result) => result?,
            Err(_) => return Err(IpcError::OperationTimeout(millis)),
        }

        match timeout(self.timeout, read_frame(stream)).await {
            Ok(result) => result,
            Err(_) => Err(IpcError::OperationTimeout(millis)),
        }
    }
}

/// Write one length-prefixed bincode frame
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let serialized = serialize(msg)?;
    if serialized.len() > MAX_MESSAGE_SIZE {
        return Err(IpcError::MessageTooLarge(serialized.len(), MAX_MESSAGE_SIZE));
    }

    let len = serialized.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&serialized).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed bincode frame
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, IpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(IpcError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    deserialize(&buffer)
}

/// Send a request to the daemon at a specific socket path
pub async fn send_to_path<P: AsRef<Path>>(request: &Request, socket_path: P) -> Result<Response, IpcError> {
    let client = IpcClient::with_socket_path(socket_path);
    client.send(request).await
}

/// Serialize a message using bincode
pub fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    bincode::serialize(msg)
        .map_err(|e| IpcError::Serialization(e.to_string()))
}

/// Deserialize a message using bincode
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IpcError> {
    bincode::deserialize(bytes)
        .map_err(|e| IpcError::Serialization(e.to_string()))
}
