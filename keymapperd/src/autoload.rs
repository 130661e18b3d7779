//! Autoload bookkeeping
//!
//! Autoload sweeps run on every hotplug and login, so most of them find the
//! configured preset already running. The history remembers when each device
//! was last autoloaded and with which preset, and refuses to autoload the
//! same pair again inside [`AUTOLOAD_COOLDOWN`].

use keymapper_common::{tracing, DeviceKey, PresetId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::clock::{Clock, SystemClock};

/// How long an autoloaded (device, preset) pair is considered satisfied
pub const AUTOLOAD_COOLDOWN: Duration = Duration::from_secs(15);

/// Per device record of the last autoload
pub struct AutoloadHistory {
    entries: HashMap<DeviceKey, (Instant, PresetId)>,
    clock: Arc<dyn Clock>,
}

impl AutoloadHistory {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
        }
    }

    /// Remember that `preset` was just autoloaded for `device`
    pub fn record(&mut self, device: &DeviceKey, preset: &PresetId) {
        self.entries
            .insert(device.clone(), (self.clock.now(), preset.clone()));
    }

    /// Forget the autoload of `device`, allowing an immediate reload
    pub fn invalidate(&mut self, device: &DeviceKey) {
        if self.entries.remove(device).is_some() {
            debug!("Forgot autoload history of {}", device);
        }
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    /// Whether autoloading `preset` for `device` would not be redundant
    pub fn may_autoload(&self, device: &DeviceKey, preset: &PresetId) -> bool {
        match self.entries.get(device) {
            None => true,
            Some((_, recorded)) if recorded != preset => true,
            Some((at, _)) => self.clock.now().saturating_duration_since(*at) >= AUTOLOAD_COOLDOWN,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AutoloadHistory {
    fn default() -> Self {
        Self::new()
    }
}
