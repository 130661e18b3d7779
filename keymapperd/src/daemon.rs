//! Injection lifecycle
//!
//! The [`Daemon`] owns the table of running injections and the autoload
//! history. It is driven by one caller at a time (the IPC server keeps it
//! behind a mutex), which is what makes the check-then-record sequence of
//! autoloading atomic.

use keymapper_common::{tracing, DeviceGroup, DeviceKey, InjectionInfo, PresetId};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::autoload::AutoloadHistory;
use crate::config::{Config, ConfigError, ConfigManager};
use crate::groups::DeviceRegistry;
use crate::injector::{Injection, InjectorError, InjectorFactory};
use crate::preset::Preset;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceKey),
    #[error("preset {preset} of {device} not found at {path}")]
    MissingPreset {
        device: DeviceKey,
        preset: PresetId,
        path: String,
    },
    #[error("failed to load preset: {0}")]
    Preset(#[from] ConfigError),
    #[error("failed to start injecting: {0}")]
    Injector(#[from] InjectorError),
}

struct Running {
    preset: PresetId,
    injection: Box<dyn Injection>,
}

pub struct Daemon {
    injectors: BTreeMap<DeviceKey, Running>,
    autoload_history: AutoloadHistory,
    config: ConfigManager,
    registry: DeviceRegistry,
    factory: Arc<dyn InjectorFactory>,
}

impl Daemon {
    pub fn new(config: ConfigManager, registry: DeviceRegistry, factory: Arc<dyn InjectorFactory>) -> Self {
        Self::with_history(config, registry, factory, AutoloadHistory::new())
    }

    pub fn with_history(
        config: ConfigManager,
        registry: DeviceRegistry,
        factory: Arc<dyn InjectorFactory>,
        autoload_history: AutoloadHistory,
    ) -> Self {
        Self {
            injectors: BTreeMap::new(),
            autoload_history,
            config,
            registry,
            factory,
        }
    }

    pub fn autoload_history(&self) -> &AutoloadHistory {
        &self.autoload_history
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.config()
    }

    pub fn config_manager(&self) -> &ConfigManager {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn refresh_groups(&mut self) {
        self.registry.refresh();
    }

    pub fn is_injecting(&self, device: &DeviceKey) -> bool {
        self.injectors
            .get(device)
            .map_or(false, |running| !running.injection.is_finished())
    }

    /// Devices currently injected into, with their presets
    pub fn running(&self) -> Vec<InjectionInfo> {
        self.injectors
            .iter()
            .filter(|(_, running)| !running.injection.is_finished())
            .map(|(device, running)| InjectionInfo {
                device: device.clone(),
                preset: running.preset.clone(),
            })
            .collect()
    }

    /// Drop injections that ended on their own, e.g. because the device was
    /// unplugged. Their autoload history goes with them, so a replugged
    /// device is autoloaded again right away.
    pub fn reap_finished(&mut self) {
        let finished: Vec<DeviceKey> = self
            .injectors
            .iter()
            .filter(|(_, running)| running.injection.is_finished())
            .map(|(device, _)| device.clone())
            .collect();

        for device in finished {
            if let Some(running) = self.injectors.remove(&device) {
                warn!("Injection of {} into {} ended", running.preset, device);
            }
            self.autoload_history.invalidate(&device);
        }
    }

    /// Read presets and configuration from `dir` from now on, if it has a
    /// config file. Returns the configuration in effect.
    pub async fn set_config_dir<P: AsRef<Path>>(&mut self, dir: P) -> Arc<Config> {
        self.config.set_config_dir(dir).await
    }

    /// Look up a group by key, rescanning once if it isn't known yet
    fn group(&mut self, device: &DeviceKey) -> Option<DeviceGroup> {
        if let Some(group) = self.registry.find_key(device) {
            return Some(group.clone());
        }
        debug!("{} not known, rescanning devices", device);
        self.registry.refresh();
        self.registry.find_key(device).cloned()
    }

    /// Start injecting `preset` into `device`, replacing whatever runs there.
    ///
    /// Leaves the autoload history alone.
    pub async fn start_injecting(&mut self, device: &DeviceKey, preset: &PresetId) -> Result<(), DaemonError> {
        let group = self
            .group(device)
            .ok_or_else(|| DaemonError::UnknownDevice(device.clone()))?;

        let path = self.config.preset_path(&group.name, preset);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(DaemonError::MissingPreset {
                device: device.clone(),
                preset: preset.clone(),
                path: path.display().to_string(),
            });
        }
        let mapping = Preset::load(&path).await?;

        // two injections would fight over the grab
        if let Some(mut previous) = self.injectors.remove(device) {
            info!("Replacing preset {} of {}", previous.preset, device);
            previous.injection.stop();
        }

        let injection = self.factory.start(&group, preset, mapping).await?;
        self.injectors.insert(
            device.clone(),
            Running {
                preset: preset.clone(),
                injection,
            },
        );
        info!("Started injecting {} into {}", preset, device);
        Ok(())
    }

    /// Stop injecting into `device`. Always forgets its autoload history.
    pub fn stop_injecting(&mut self, device: &DeviceKey) {
        match self.injectors.remove(device) {
            Some(mut running) => {
                running.injection.stop();
                info!("Stopped injecting {} into {}", running.preset, device);
            }
            None => debug!("Not injecting into {}, nothing to stop", device),
        }
        self.autoload_history.invalidate(device);
    }

    pub fn stop_all(&mut self) {
        info!("Stopping all injections");
        for (device, mut running) in std::mem::take(&mut self.injectors) {
            running.injection.stop();
            debug!("Stopped injecting {} into {}", running.preset, device);
        }
        self.autoload_history.invalidate_all();
    }

    /// Autoload the configured preset of one device, unless it was just
    /// autoloaded. Failures are logged, never returned.
    pub async fn autoload_single(&mut self, device: &DeviceKey) {
        self.reap_finished();
        // event node paths change when a device is plugged in again
        self.registry.refresh();

        let config = self.config.config();
        let preset = config
            .autoload_preset(device.as_str())
            .cloned()
            .or_else(|| self.configured_preset_by_alias(&config, device));

        let Some(preset) = preset else {
            debug!("No autoload preset configured for {}", device);
            return;
        };

        self.autoload_device(device, &preset).await;
    }

    /// Autoload every configured device. Each device is handled on its own,
    /// a failure for one doesn't affect the others.
    pub async fn autoload(&mut self) {
        self.reap_finished();

        let config = self.config.config();
        if config.autoload.is_empty() {
            info!("No presets configured to autoload");
            return;
        }

        self.registry.refresh();
        for (device, preset) in self.autoload_targets(&config) {
            self.autoload_device(&device, &preset).await;
        }
    }

    /// One preset per device group. Config entries may name a device by key,
    /// name or path, so several can point at the same group: an entry using
    /// the key wins, otherwise the first one.
    fn autoload_targets(&self, config: &Config) -> BTreeMap<DeviceKey, PresetId> {
        let (exact, aliases): (Vec<_>, Vec<_>) = config
            .autoload
            .iter()
            .partition(|(identifier, _)| {
                self.registry
                    .find_key(&DeviceKey::new(identifier.as_str()))
                    .is_some()
            });

        let mut targets = BTreeMap::new();
        for (identifier, preset) in exact.into_iter().chain(aliases) {
            let Some(group) = self.registry.find(identifier) else {
                warn!("Can't autoload {} for {}: device not found", preset, identifier);
                continue;
            };
            match targets.entry(group.key.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(preset.clone());
                }
                Entry::Occupied(entry) if entry.get() != preset => warn!(
                    "Ignoring autoload of {} for {}, {} is configured for {} already",
                    preset,
                    identifier,
                    entry.get(),
                    entry.key()
                ),
                Entry::Occupied(_) => {}
            }
        }
        targets
    }

    async fn autoload_device(&mut self, device: &DeviceKey, preset: &PresetId) {
        if !self.autoload_history.may_autoload(device, preset) {
            debug!("{} is already autoloaded for {}", preset, device);
            return;
        }

        match self.start_injecting(device, preset).await {
            Ok(()) => self.autoload_history.record(device, preset),
            Err(e) => error!("Autoloading {} for {} failed: {}", preset, device, e),
        }
    }

    fn configured_preset_by_alias(&self, config: &Config, device: &DeviceKey) -> Option<PresetId> {
        config.autoload.iter().find_map(|(identifier, preset)| {
            let group = self.registry.find(identifier)?;
            (&group.key == device).then(|| preset.clone())
        })
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        for running in self.injectors.values_mut() {
            running.injection.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::preset_path;
    use crate::groups::{GroupScanner, ScanError};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        starts: Mutex<Vec<(DeviceKey, PresetId)>>,
        paths: Mutex<Vec<Vec<PathBuf>>>,
        stops: Mutex<usize>,
        stopped_flags: Mutex<Vec<Arc<AtomicBool>>>,
        finished_flags: Mutex<Vec<Arc<AtomicBool>>>,
    }

    struct FakeInjection {
        recorder: Arc<Recorder>,
        stopped: Arc<AtomicBool>,
        finished: Arc<AtomicBool>,
    }

    impl Injection for FakeInjection {
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
            *self.recorder.stops.lock().unwrap() += 1;
        }

        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }
    }

    struct FakeFactory(Arc<Recorder>);

    #[async_trait::async_trait]
    impl InjectorFactory for FakeFactory {
        async fn start(
            &self,
            group: &DeviceGroup,
            preset_id: &PresetId,
            _preset: Preset,
        ) -> Result<Box<dyn Injection>, InjectorError> {
            self.0.starts.lock().unwrap().push((group.key.clone(), preset_id.clone()));
            self.0.paths.lock().unwrap().push(group.paths.clone());
            let stopped = Arc::new(AtomicBool::new(false));
            self.0.stopped_flags.lock().unwrap().push(Arc::clone(&stopped));
            let finished = Arc::new(AtomicBool::new(false));
            self.0.finished_flags.lock().unwrap().push(Arc::clone(&finished));
            Ok(Box::new(FakeInjection {
                recorder: Arc::clone(&self.0),
                stopped,
                finished,
            }))
        }
    }

    /// Scanner whose result the test can swap, like a device being replugged
    #[derive(Clone, Default)]
    struct SwappableScanner(Arc<Mutex<Vec<DeviceGroup>>>);

    impl SwappableScanner {
        fn set(&self, groups: Vec<DeviceGroup>) {
            *self.0.lock().unwrap() = groups;
        }
    }

    impl GroupScanner for SwappableScanner {
        fn scan(&self) -> Result<Vec<DeviceGroup>, ScanError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        root: PathBuf,
        recorder: Arc<Recorder>,
        clock: ManualClock,
        daemon: Daemon,
    }

    fn groups() -> Vec<DeviceGroup> {
        vec![
            DeviceGroup::new(
                "Foo Device 2",
                "Foo Device",
                vec![PathBuf::from("/dev/input/event10"), PathBuf::from("/dev/input/event11")],
            ),
            DeviceGroup::new("Bar Device", "Bar Device", vec![PathBuf::from("/dev/input/event20")]),
        ]
    }

    async fn fixture(presets: &[(&str, &str)]) -> Fixture {
        fixture_with_registry(presets, DeviceRegistry::new(groups())).await
    }

    async fn fixture_with_registry(presets: &[(&str, &str)], registry: DeviceRegistry) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        for (group_name, preset) in presets {
            Preset::default()
                .save(&preset_path(&root, group_name, &PresetId::from(*preset)))
                .await
                .unwrap();
        }

        let recorder = Arc::new(Recorder::default());
        let clock = ManualClock::new();
        let daemon = Daemon::with_history(
            ConfigManager::new(&root),
            registry,
            Arc::new(FakeFactory(Arc::clone(&recorder))),
            AutoloadHistory::with_clock(Arc::new(clock.clone())),
        );

        Fixture {
            _temp_dir: temp_dir,
            root,
            recorder,
            clock,
            daemon,
        }
    }

    impl Fixture {
        fn starts(&self) -> Vec<(DeviceKey, PresetId)> {
            self.recorder.starts.lock().unwrap().clone()
        }

        fn last_paths(&self) -> Vec<PathBuf> {
            self.recorder.paths.lock().unwrap().last().cloned().unwrap_or_default()
        }

        fn stops(&self) -> usize {
            *self.recorder.stops.lock().unwrap()
        }

        async fn configure(&mut self, entries: &[(&str, &str)]) {
            let mut config = (*self.daemon.config()).clone();
            for (device, preset) in entries {
                config.set_autoload_preset(device, *preset);
            }
            self.daemon.config.update(config).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_replaces_running_injection() {
        let mut f = fixture(&[("Foo Device", "a"), ("Foo Device", "b")]).await;
        let foo = DeviceKey::from("Foo Device 2");

        f.daemon.start_injecting(&foo, &"a".into()).await.unwrap();
        f.daemon.start_injecting(&foo, &"b".into()).await.unwrap();

        assert_eq!(f.starts().len(), 2);
        assert_eq!(f.stops(), 1);
        assert!(f.recorder.stopped_flags.lock().unwrap()[0].load(Ordering::SeqCst));
        assert_eq!(
            f.daemon.running(),
            vec![InjectionInfo { device: foo, preset: "b".into() }]
        );
    }

    #[tokio::test]
    async fn test_start_does_not_touch_history() {
        let mut f = fixture(&[("Bar Device", "bar")]).await;
        let bar = DeviceKey::from("Bar Device");

        f.daemon.start_injecting(&bar, &"bar".into()).await.unwrap();
        assert!(f.daemon.autoload_history().may_autoload(&bar, &"bar".into()));
    }

    #[tokio::test]
    async fn test_start_unknown_device_or_preset() {
        let mut f = fixture(&[("Bar Device", "bar")]).await;

        let result = f.daemon.start_injecting(&"Qux".into(), &"bar".into()).await;
        assert!(matches!(result, Err(DaemonError::UnknownDevice(_))));

        let result = f.daemon.start_injecting(&"Bar Device".into(), &"nope".into()).await;
        assert!(matches!(result, Err(DaemonError::MissingPreset { .. })));

        assert!(f.starts().is_empty());
        assert!(f.daemon.running().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_injection_is_a_noop() {
        let mut f = fixture(&[]).await;
        f.daemon.stop_injecting(&"Bar Device".into());
        assert_eq!(f.stops(), 0);
    }

    #[tokio::test]
    async fn test_autoload_is_debounced() {
        let mut f = fixture(&[("Foo Device", "bar0"), ("Bar Device", "bar")]).await;
        f.configure(&[("Foo Device 2", "bar0"), ("Bar Device", "bar")]).await;

        f.daemon.autoload().await;
        f.daemon.autoload().await;

        assert_eq!(f.starts().len(), 2);
        assert_eq!(f.stops(), 0);

        // same pair is eligible again once the cooldown passed
        f.clock.advance(Duration::from_secs(16));
        f.daemon.autoload().await;
        assert_eq!(f.starts().len(), 4);
        assert_eq!(f.stops(), 2);
    }

    #[tokio::test]
    async fn test_stop_allows_immediate_autoload() {
        let mut f = fixture(&[("Bar Device", "bar")]).await;
        f.configure(&[("Bar Device", "bar")]).await;
        let bar = DeviceKey::from("Bar Device");

        f.daemon.autoload_single(&bar).await;
        assert!(!f.daemon.autoload_history().may_autoload(&bar, &"bar".into()));

        f.daemon.stop_injecting(&bar);
        assert!(f.daemon.autoload_history().may_autoload(&bar, &"bar".into()));
        assert!(!f.daemon.is_injecting(&bar));

        f.daemon.autoload_single(&bar).await;
        assert_eq!(f.starts().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_autoload_is_not_recorded() {
        let mut f = fixture(&[("Foo Device", "bar0")]).await;
        f.configure(&[("Foo Device 2", "bar0"), ("Bar Device", "missing"), ("Qux Device", "x")]).await;

        f.daemon.autoload().await;

        assert_eq!(f.starts(), vec![(DeviceKey::from("Foo Device 2"), PresetId::from("bar0"))]);
        assert!(f.daemon.autoload_history().may_autoload(&"Bar Device".into(), &"missing".into()));
        assert_eq!(f.daemon.autoload_history().len(), 1);
    }

    #[tokio::test]
    async fn test_autoload_single_accepts_config_by_path() {
        let mut f = fixture(&[("Foo Device", "bar0")]).await;
        f.configure(&[("/dev/input/event11", "bar0")]).await;

        f.daemon.autoload_single(&"Foo Device 2".into()).await;
        assert_eq!(f.starts(), vec![(DeviceKey::from("Foo Device 2"), PresetId::from("bar0"))]);

        // not configured at all
        f.daemon.autoload_single(&"Bar Device".into()).await;
        assert_eq!(f.starts().len(), 1);
    }

    #[tokio::test]
    async fn test_config_dir_moves_preset_lookup() {
        let mut f = fixture(&[]).await;
        let other = f.root.join("qux").join("quux");
        let mut config = Config::default();
        config.set_autoload_preset("Bar Device", "bar2");
        config.save(&other.join(crate::config::CONFIG_FILE)).await.unwrap();
        Preset::default()
            .save(&preset_path(&other, "Bar Device", &"bar2".into()))
            .await
            .unwrap();

        f.daemon.set_config_dir(&other).await;
        f.daemon.autoload().await;
        assert_eq!(f.starts(), vec![(DeviceKey::from("Bar Device"), PresetId::from("bar2"))]);
    }

    #[tokio::test]
    async fn test_aliases_of_one_device_autoload_once() {
        let mut f = fixture(&[("Foo Device", "a"), ("Foo Device", "b"), ("Foo Device", "c")]).await;
        f.configure(&[("/dev/input/event10", "b"), ("Foo Device 2", "a"), ("Foo Device", "c")]).await;

        f.daemon.autoload().await;
        f.daemon.autoload().await;

        // the entry naming the key wins
        assert_eq!(f.starts(), vec![(DeviceKey::from("Foo Device 2"), PresetId::from("a"))]);
        assert_eq!(f.stops(), 0);
    }

    #[tokio::test]
    async fn test_autoload_uses_current_event_nodes() {
        let scanner = SwappableScanner::default();
        let bar = |node: &str| {
            vec![DeviceGroup::new("Bar Device", "Bar Device", vec![PathBuf::from(node)])]
        };
        scanner.set(bar("/dev/input/event20"));

        let registry = DeviceRegistry::with_scanner(Box::new(scanner.clone()));
        let mut f = fixture_with_registry(&[("Bar Device", "bar")], registry).await;
        f.configure(&[("Bar Device", "bar")]).await;
        let key = DeviceKey::from("Bar Device");

        f.daemon.autoload_single(&key).await;
        assert_eq!(f.last_paths(), vec![PathBuf::from("/dev/input/event20")]);

        f.daemon.stop_injecting(&key);
        scanner.set(bar("/dev/input/event22"));
        f.daemon.autoload_single(&key).await;
        assert_eq!(f.last_paths(), vec![PathBuf::from("/dev/input/event22")]);

        f.daemon.stop_all();
        scanner.set(bar("/dev/input/event23"));
        f.daemon.autoload().await;
        assert_eq!(f.last_paths(), vec![PathBuf::from("/dev/input/event23")]);
        assert_eq!(f.starts().len(), 3);
    }

    #[tokio::test]
    async fn test_ended_injection_is_dropped() {
        let mut f = fixture(&[("Bar Device", "bar")]).await;
        f.configure(&[("Bar Device", "bar")]).await;
        let bar = DeviceKey::from("Bar Device");

        f.daemon.autoload_single(&bar).await;
        assert!(f.daemon.is_injecting(&bar));

        // unplugged
        f.recorder.finished_flags.lock().unwrap()[0].store(true, Ordering::SeqCst);
        assert!(!f.daemon.is_injecting(&bar));
        assert!(f.daemon.running().is_empty());

        f.daemon.reap_finished();
        assert!(f.daemon.autoload_history().may_autoload(&bar, &"bar".into()));

        // replugged within the cooldown
        f.daemon.autoload_single(&bar).await;
        assert_eq!(f.starts().len(), 2);
        assert!(f.daemon.is_injecting(&bar));
        assert_eq!(f.stops(), 0);
    }
}
