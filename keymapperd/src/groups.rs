//! Device group discovery and resolution
//!
//! One physical device usually exposes several event nodes (a keyboard with
//! media keys shows up as two or three `/dev/input/event*` files). They are
//! bundled into a [`DeviceGroup`] so that every node resolves to the same
//! [`DeviceKey`].

use keymapper_common::{tracing, DeviceGroup, DeviceKey};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use evdev::Device as EvdevDevice;

use crate::injector::VIRTUAL_DEVICE_NAME;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("failed to read {0}: {1}")]
    ReadDir(PathBuf, std::io::Error),
}

/// Something that can enumerate the device groups currently plugged in
pub trait GroupScanner: Send + Sync {
    fn scan(&self) -> Result<Vec<DeviceGroup>, ScanError>;
}

/// One event node as seen by the scanner
#[derive(Debug, Clone)]
pub struct EventNode {
    pub path: PathBuf,
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub phys: String,
}

impl EventNode {
    /// Nodes of one device share vendor, product and the phys prefix
    /// before the trailing `/inputN`.
    fn group_id(&self) -> (u16, u16, String) {
        let stem = match self.phys.rsplit_once('/') {
            Some((stem, _)) => stem.to_string(),
            None => self.phys.clone(),
        };
        (self.vendor_id, self.product_id, stem)
    }

    /// `N` of an `eventN` node, so `event2` sorts before `event10`
    fn event_number(&self) -> Option<u32> {
        self.path
            .file_name()?
            .to_str()?
            .strip_prefix("event")?
            .parse()
            .ok()
    }
}

/// Bundle event nodes into groups with unique keys.
///
/// The key is the shortest member name. Repeated names get ` 2`, ` 3`, ...
/// appended in order of their first event node.
pub fn build_groups(mut nodes: Vec<EventNode>) -> Vec<DeviceGroup> {
    nodes.sort_by(|a, b| {
        let a_num = a.event_number().unwrap_or(u32::MAX);
        let b_num = b.event_number().unwrap_or(u32::MAX);
        a_num.cmp(&b_num).then_with(|| a.path.cmp(&b.path))
    });

    let mut order = Vec::new();
    let mut bundles: BTreeMap<(u16, u16, String), Vec<EventNode>> = BTreeMap::new();
    for node in nodes {
        let id = node.group_id();
        if !bundles.contains_key(&id) {
            order.push(id.clone());
        }
        bundles.entry(id).or_default().push(node);
    }

    let mut used = HashSet::new();
    let mut groups = Vec::new();
    for id in order {
        let Some(members) = bundles.remove(&id) else {
            continue;
        };

        let name = members
            .iter()
            .map(|n| n.name.as_str())
            .min_by_key(|n| n.len())
            .unwrap_or("Unknown Device")
            .to_string();

        let mut key = name.clone();
        let mut suffix = 2;
        while used.contains(&key) {
            key = format!("{} {}", name, suffix);
            suffix += 1;
        }
        used.insert(key.clone());

        let paths = members.into_iter().map(|n| n.path).collect();
        groups.push(DeviceGroup::new(key, name, paths));
    }

    groups
}

/// Scans `/dev/input/event*` with evdev
pub struct EvdevScanner {
    input_dir: PathBuf,
}

impl EvdevScanner {
    pub fn new() -> Self {
        Self::with_input_dir("/dev/input")
    }

    pub fn with_input_dir<P: AsRef<Path>>(input_dir: P) -> Self {
        Self {
            input_dir: input_dir.as_ref().to_path_buf(),
        }
    }

    fn read_node(path: &Path) -> Option<EventNode> {
        let device = match EvdevDevice::open(path) {
            Ok(device) => device,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                return None;
            }
        };

        let name = device.name().unwrap_or("Unknown Device").to_string();
        if name.starts_with(VIRTUAL_DEVICE_NAME) {
            return None;
        }

        // nothing to remap on nodes without keys
        let has_keys = device
            .supported_keys()
            .map(|keys| keys.iter().next().is_some())
            .unwrap_or(false);
        if !has_keys {
            return None;
        }

        let input_id = device.input_id();
        Some(EventNode {
            path: path.to_path_buf(),
            name,
            vendor_id: input_id.vendor(),
            product_id: input_id.product(),
            phys: device.physical_path().unwrap_or("unknown").to_string(),
        })
    }
}

impl Default for EvdevScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupScanner for EvdevScanner {
    fn scan(&self) -> Result<Vec<DeviceGroup>, ScanError> {
        let entries = fs::read_dir(&self.input_dir)
            .map_err(|e| ScanError::ReadDir(self.input_dir.clone(), e))?;

        let mut nodes = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_event = path
                .file_name()
                .and_then(|s| s.to_str())
                .map(|name| name.starts_with("event"))
                .unwrap_or(false);

            if is_event {
                if let Some(node) = Self::read_node(&path) {
                    nodes.push(node);
                }
            }
        }

        Ok(build_groups(nodes))
    }
}

/// Resolves device identifiers to device groups
pub struct DeviceRegistry {
    groups: Vec<DeviceGroup>,
    scanner: Option<Box<dyn GroupScanner>>,
}

impl DeviceRegistry {
    /// A registry with a fixed set of groups
    pub fn new(groups: Vec<DeviceGroup>) -> Self {
        Self {
            groups,
            scanner: None,
        }
    }

    /// A registry that fills itself from `scanner`, now and on every refresh
    pub fn with_scanner(scanner: Box<dyn GroupScanner>) -> Self {
        let mut registry = Self {
            groups: Vec::new(),
            scanner: Some(scanner),
        };
        registry.refresh();
        registry
    }

    /// Rescan for devices. Keeps the current groups if scanning fails.
    pub fn refresh(&mut self) {
        let Some(scanner) = &self.scanner else {
            return;
        };

        match scanner.scan() {
            Ok(groups) => {
                info!("Found {} device groups", groups.len());
                for group in &groups {
                    debug!("Device group {}: {:?}", group.key, group.paths);
                }
                self.groups = groups;
            }
            Err(e) => warn!("Device scan failed: {}", e),
        }
    }

    pub fn groups(&self) -> &[DeviceGroup] {
        &self.groups
    }

    /// Find the group of a key, event node path or device name.
    ///
    /// Keys win over paths, paths over names, since a name may be shared by
    /// several groups.
    pub fn find(&self, identifier: &str) -> Option<&DeviceGroup> {
        if let Some(group) = self.groups.iter().find(|g| g.key.as_str() == identifier) {
            return Some(group);
        }

        let path = Path::new(identifier);
        if let Some(group) = self.groups.iter().find(|g| g.has_path(path)) {
            return Some(group);
        }

        // /dev/input/by-id and by-path entries are symlinks to event nodes
        if let Ok(resolved) = fs::canonicalize(path) {
            if let Some(group) = self.groups.iter().find(|g| g.has_path(&resolved)) {
                return Some(group);
            }
        }

        self.groups.iter().find(|g| g.name == identifier)
    }

    pub fn find_key(&self, key: &DeviceKey) -> Option<&DeviceGroup> {
        self.groups.iter().find(|g| &g.key == key)
    }
}
