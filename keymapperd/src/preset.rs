use keymapper_common::tracing;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::config::ConfigError;

/// Highest evdev key code
const KEY_MAX: u16 = 0x2ff;

/// Names of all key and button codes evdev knows, in code order
pub fn key_names() -> Vec<String> {
    (0..=KEY_MAX)
        .map(|code| format!("{:?}", evdev::Key::new(code)))
        .filter(|name| name.starts_with("KEY_") || name.starts_with("BTN_"))
        .collect()
}

/// A saved remapping: evdev key code in, key code out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default)]
    pub mapping: BTreeMap<u16, u16>,
}

impl Preset {
    pub fn map(&mut self, from: u16, to: u16) -> &mut Self {
        self.mapping.insert(from, to);
        self
    }

    /// Code to emit for `code`, which is the code itself when unmapped
    pub fn translate(&self, code: u16) -> u16 {
        self.mapping.get(&code).copied().unwrap_or(code)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let preset = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        debug!("Loaded preset {}", path.display());
        Ok(preset)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Serialize(path.to_path_buf(), e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::Io(parent.to_path_buf(), e))?;
        }
        fs::write(path, content)
            .await
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }
}
