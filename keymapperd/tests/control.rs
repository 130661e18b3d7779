//! keymapper-control commands against an in-process daemon

use keymapper_common::{DeviceGroup, DeviceKey, PresetId};
use keymapperd::autoload::AutoloadHistory;
use keymapperd::clock::ManualClock;
use keymapperd::config::{Config, ConfigManager, CONFIG_FILE};
use keymapperd::control::{Command, ControlError, Dispatcher, Options};
use keymapperd::groups::DeviceRegistry;
use keymapperd::injector::{Injection, InjectorError, InjectorFactory};
use keymapperd::preset::Preset;
use keymapperd::Daemon;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type Starts = Arc<Mutex<Vec<(String, String)>>>;

struct CountedInjection {
    stops: Arc<AtomicUsize>,
}

impl Injection for CountedInjection {
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        false
    }
}

struct CountingFactory {
    starts: Starts,
    stops: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl InjectorFactory for CountingFactory {
    async fn start(
        &self,
        group: &DeviceGroup,
        preset_id: &PresetId,
        _preset: Preset,
    ) -> Result<Box<dyn Injection>, InjectorError> {
        self.starts
            .lock()
            .unwrap()
            .push((group.key.to_string(), preset_id.to_string()));
        Ok(Box::new(CountedInjection {
            stops: Arc::clone(&self.stops),
        }))
    }
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

async fn write_presets(root: &Path, group_name: &str, presets: &[&str]) {
    let manager = ConfigManager::new(root);
    for preset in presets {
        let mut mapping = Preset::default();
        mapping.map(30, 48);
        mapping
            .save(&manager.preset_path(group_name, &PresetId::from(*preset)))
            .await
            .unwrap();
    }
}

async fn write_autoload(root: &Path, entries: &[(&str, &str)]) {
    let mut config = Config::default();
    for (device, preset) in entries {
        config.set_autoload_preset(device, *preset);
    }
    config.save(&root.join(CONFIG_FILE)).await.unwrap();
}

struct Setup {
    _temp_dir: TempDir,
    root: PathBuf,
    daemon: Daemon,
    dispatcher: Dispatcher,
    clock: ManualClock,
    starts: Starts,
    stops: Arc<AtomicUsize>,
}

impl Setup {
    async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("keymapper");
        write_presets(&root, "Foo Device", &["bar0", "bar", "bar2"]).await;
        write_presets(&root, "Bar Device", &["bar", "bar2"]).await;
        write_autoload(&root, &[("Foo Device 2", "bar0"), ("Bar Device", "bar")]).await;

        let clock = ManualClock::new();
        let starts = Starts::default();
        let stops = Arc::new(AtomicUsize::new(0));
        let daemon = Daemon::with_history(
            ConfigManager::load(&root).await.unwrap(),
            DeviceRegistry::new(groups()),
            Arc::new(CountingFactory {
                starts: Arc::clone(&starts),
                stops: Arc::clone(&stops),
            }),
            AutoloadHistory::with_clock(Arc::new(clock.clone())),
        );
        let dispatcher = Dispatcher::new(
            DeviceRegistry::new(groups()),
            ConfigManager::load(&root).await.unwrap(),
        );

        Self {
            _temp_dir: temp_dir,
            root,
            daemon,
            dispatcher,
            clock,
            starts,
            stops,
        }
    }

    async fn run(&mut self, options: Options) -> Result<(), ControlError> {
        self.dispatcher.communicate(&options, &mut self.daemon).await
    }

    fn started(&self) -> Vec<(String, String)> {
        self.starts.lock().unwrap().clone()
    }

    fn stopped(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

fn command(command: Command, device: Option<&str>) -> Options {
    Options {
        command: Some(command),
        device: device.map(str::to_string),
        ..Options::default()
    }
}

fn start(device: &str, preset: &str) -> Options {
    Options {
        preset: Some(preset.to_string()),
        ..command(Command::Start, Some(device))
    }
}

#[tokio::test]
async fn test_autoload_lifecycle() {
    let mut setup = Setup::new().await;

    setup.run(command(Command::Autoload, None)).await.unwrap();
    assert_eq!(setup.started().len(), 2);

    // debounced
    setup.run(command(Command::Autoload, None)).await.unwrap();
    assert_eq!(setup.started().len(), 2);
    assert_eq!(setup.stopped(), 0);

    setup.run(command(Command::Stop, Some("Foo Device 2"))).await.unwrap();
    assert_eq!(setup.stopped(), 1);
    setup.run(command(Command::Autoload, None)).await.unwrap();
    let started = setup.started();
    assert_eq!(started.len(), 3);
    assert_eq!(started[2], ("Foo Device 2".to_string(), "bar0".to_string()));

    setup.run(command(Command::StopAll, None)).await.unwrap();
    assert!(setup.daemon.running().is_empty());
    assert_eq!(setup.stopped(), 3);
    write_autoload(&setup.root, &[("Foo Device 2", "bar0"), ("Bar Device", "bar2")]).await;

    setup.run(command(Command::Autoload, Some("Bar Device"))).await.unwrap();
    let started = setup.started();
    assert_eq!(started.len(), 4);
    assert_eq!(started[3], ("Bar Device".to_string(), "bar2".to_string()));

    setup.run(command(Command::Autoload, Some("Bar Device"))).await.unwrap();
    assert_eq!(setup.started().len(), 4);
    assert_eq!(setup.stopped(), 3);

    let bar = DeviceKey::from("Bar Device");
    let history = setup.daemon.autoload_history();
    assert!(!history.may_autoload(&bar, &PresetId::from("bar2")));
    assert!(history.may_autoload(&bar, &PresetId::from("foo")));

    setup.clock.advance(Duration::from_secs(16));
    assert!(setup.daemon.autoload_history().may_autoload(&bar, &PresetId::from("bar2")));
}

#[tokio::test]
async fn test_stop_by_path_alias() {
    let mut setup = Setup::new().await;

    setup.run(start("/dev/input/event10", "bar")).await.unwrap();
    assert!(setup.daemon.is_injecting(&DeviceKey::from("Foo Device 2")));

    setup.run(command(Command::Stop, Some("/dev/input/event11"))).await.unwrap();
    assert!(setup.daemon.running().is_empty());
    assert_eq!(setup.stopped(), 1);
}

#[tokio::test]
async fn test_unknown_device_is_fatal() {
    let mut setup = Setup::new().await;
    setup.run(start("Bar Device", "bar")).await.unwrap();
    let before = setup.daemon.running();

    let result = setup.run(start("/dev/input/event99", "bar")).await;
    assert!(matches!(result, Err(ControlError::UnknownDevice(_))));
    let result = setup.run(command(Command::Stop, Some("Qux Device"))).await;
    assert!(matches!(result, Err(ControlError::UnknownDevice(_))));

    assert_eq!(setup.daemon.running(), before);
    assert_eq!(setup.started().len(), 1);
}

#[tokio::test]
async fn test_missing_preset_in_config_dir_is_fatal() {
    let mut setup = Setup::new().await;
    let other = setup.root.with_file_name("other");
    write_autoload(&other, &[]).await;

    // "bar" exists in the default root only
    let options = Options {
        config_dir: Some(other.clone()),
        ..start("Bar Device", "bar")
    };
    let result = setup.run(options).await;
    assert!(matches!(result, Err(ControlError::MissingPreset { .. })));
    assert!(setup.started().is_empty());
}

#[tokio::test]
async fn test_autoload_from_config_dir() {
    let mut setup = Setup::new().await;
    let other = setup.root.with_file_name("other");
    write_presets(&other, "Foo Device", &["qux"]).await;
    write_autoload(&other, &[("/dev/input/event11", "qux")]).await;

    let options = Options {
        config_dir: Some(other.clone()),
        ..command(Command::Autoload, None)
    };
    setup.run(options).await.unwrap();

    assert_eq!(setup.started(), vec![("Foo Device 2".to_string(), "qux".to_string())]);
    assert_eq!(setup.daemon.config_manager().root(), other.as_path());
}

#[tokio::test]
async fn test_config_dir_without_config_changes_nothing() {
    let mut setup = Setup::new().await;
    let before = setup.daemon.config();

    let options = Options {
        config_dir: Some(setup.root.join("nonexistent")),
        ..command(Command::StopAll, None)
    };
    setup.run(options).await.unwrap();

    assert_eq!(*setup.daemon.config(), *before);
    assert_eq!(setup.daemon.config_manager().root(), setup.root.as_path());
}
