use keymapper_common::{tracing, PresetId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Name of the configuration file inside a config root
pub const CONFIG_FILE: &str = "config.yaml";

/// Directory below the config root holding one folder of presets per device
pub const PRESETS_DIR: &str = "presets";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, serde_yaml::Error),
    #[error("failed to serialize {0}: {1}")]
    Serialize(PathBuf, serde_yaml::Error),
}

/// Contents of `config.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device identifier (key, name or path) to the preset started on autoload
    #[serde(default)]
    pub autoload: BTreeMap<String, PresetId>,

    /// Settings this daemon doesn't interpret, kept for other tools
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Config {
    pub fn get(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.extra.get(key)
    }

    pub fn autoload_preset(&self, device: &str) -> Option<&PresetId> {
        self.autoload.get(device)
    }

    pub fn set_autoload_preset(&mut self, device: &str, preset: impl Into<PresetId>) {
        self.autoload.insert(device.to_string(), preset.into());
    }

    /// Read a config file
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Write a config file, creating its directory
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
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        debug!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// The active config root and the configuration last loaded from it.
///
/// The configuration itself is an immutable snapshot; switching roots swaps
/// in a fresh one instead of editing it in place.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    root: PathBuf,
    config: Arc<Config>,
}

impl ConfigManager {
    /// `$XDG_CONFIG_HOME/keymapper`
    pub fn default_root() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("/etc"));
        path.push("keymapper");
        path
    }

    /// A manager for `root` with an empty configuration, without touching disk
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self::with_config(root, Config::default())
    }

    pub fn with_config<P: AsRef<Path>>(root: P, config: Config) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            config: Arc::new(config),
        }
    }

    /// Load the configuration of `root`. A missing file means defaults.
    pub async fn load<P: AsRef<Path>>(root: P) -> Result<Self, ConfigError> {
        let root = root.as_ref();
        let path = root.join(CONFIG_FILE);
        info!("Loading configuration from {}", path.display());

        let config = if fs::try_exists(&path).await.unwrap_or(false) {
            Config::load(&path).await?
        } else {
            warn!("Configuration file not found, using defaults");
            Config::default()
        };

        Ok(Self::with_config(root, config))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Where the preset `preset` of the device group named `group_name` lives
    pub fn preset_path(&self, group_name: &str, preset: &PresetId) -> PathBuf {
        preset_path(&self.root, group_name, preset)
    }

    /// Switch to `dir` if it holds a readable config file.
    ///
    /// Anything else (missing directory, missing or broken file) keeps the
    /// current root and configuration. Returns the snapshot in effect.
    pub async fn set_config_dir<P: AsRef<Path>>(&mut self, dir: P) -> Arc<Config> {
        let dir = dir.as_ref();
        let path = dir.join(CONFIG_FILE);

        if !fs::try_exists(&path).await.unwrap_or(false) {
            debug!("No {} in {}, keeping current configuration", CONFIG_FILE, dir.display());
            return self.config();
        }

        match Config::load(&path).await {
            Ok(config) => {
                info!("Using configuration from {}", dir.display());
                self.root = dir.to_path_buf();
                self.config = Arc::new(config);
            }
            Err(e) => warn!("Ignoring config dir {}: {}", dir.display(), e),
        }

        self.config()
    }

    /// Replace the configuration and persist it under the current root
    pub async fn update(&mut self, config: Config) -> Result<Arc<Config>, ConfigError> {
        config.save(&self.config_path()).await?;
        self.config = Arc::new(config);
        Ok(self.config())
    }
}

/// `<root>/presets/<group name>/<preset>.yaml`
pub fn preset_path(root: &Path, group_name: &str, preset: &PresetId) -> PathBuf {
    root.join(PRESETS_DIR)
        .join(group_name)
        .join(format!("{}.yaml", preset))
}
