use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// Re-export common dependencies
pub use serde;
pub use bincode;
pub use tokio;
pub use tracing;

// IPC client module
pub mod ipc_client;

/// Stable identifier of a physical device group.
///
/// The same key is produced no matter which of the group's event nodes was
/// used to look the device up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceKey(pub String);

impl DeviceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Name of a saved preset, scoped to one device group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PresetId(pub String);

impl PresetId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PresetId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PresetId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// A physical input device and all event nodes that belong to it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceGroup {
    pub key: DeviceKey,
    pub name: String,
    pub paths: Vec<PathBuf>,
}

impl DeviceGroup {
    pub fn new(key: impl Into<String>, name: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self {
            key: DeviceKey::new(key),
            name: name.into(),
            paths,
        }
    }

    /// True if `path` is one of this group's event nodes
    pub fn has_path(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }
}

impl fmt::Display for DeviceGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({} paths)", self.key, self.paths.len())
    }
}

/// A device currently being injected into
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectionInfo {
    pub device: DeviceKey,
    pub preset: PresetId,
}

/// IPC Requests from keymapper-control to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Check that the daemon is alive
    Hello,

    /// Start injecting a preset into a device, replacing any running injection
    StartInjecting {
        device: DeviceKey,
        preset: PresetId,
    },

    /// Stop injecting into a device
    StopInjecting {
        device: DeviceKey,
    },

    /// Stop every running injection
    StopAll,

    /// Autoload the configured presets of every device
    Autoload,

    /// Autoload the configured preset of a single device
    AutoloadSingle {
        device: DeviceKey,
    },

    /// Read presets and config from another directory
    SetConfigDir {
        path: PathBuf,
    },

    /// Get daemon status and version
    GetStatus,
}

/// IPC Responses from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Acknowledgment of successful operation
    Ack,

    /// Reply to Hello
    Hello(String),

    /// Status information
    Status {
        version: String,
        uptime_seconds: u64,
        injecting: Vec<InjectionInfo>,
    },

    /// Error response
    Error(String),
}
