//! Keymapper Daemon Library
//!
//! This library provides the core functionality for the keymapper daemon:
//! - Device group discovery
//! - Per-device injectors that grab a device and emit remapped keys via uinput
//! - Autoload with a cooldown per device
//! - IPC communication and the control commands built on it

use std::sync::Arc;
use tokio::sync::Mutex;

pub mod autoload;
pub mod clock;
pub mod config;
pub mod control;
pub mod daemon;
pub mod groups;
pub mod injector;
pub mod ipc;
pub mod preset;
pub mod security;

// Re-export common types
pub use keymapper_common::{DeviceGroup, DeviceKey, InjectionInfo, PresetId};

pub use daemon::{Daemon, DaemonError};

/// The daemon as shared between the socket server and signal handling.
///
/// Every request takes the lock for its whole duration, so requests apply
/// one after another.
pub type SharedDaemon = Arc<Mutex<Daemon>>;

pub fn shared(daemon: Daemon) -> SharedDaemon {
    Arc::new(Mutex::new(daemon))
}
