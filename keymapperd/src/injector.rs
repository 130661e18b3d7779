use keymapper_common::{tracing, DeviceGroup, PresetId};
use std::fs::OpenOptions;
use std::mem;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use evdev::Device as EvdevDevice;

use crate::preset::Preset;

/// Prefix of the virtual devices created for injection. The scanner skips
/// them so they never show up as groups themselves.
pub const VIRTUAL_DEVICE_NAME: &str = "keymapper";

// Linux input event constants
const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_REL: u16 = 0x02;
const EV_MSC: u16 = 0x04;
const SYN_REPORT: u16 = 0x00;
const KEY_MAX: u16 = 0x2ff;
const REL_AXES: [u16; 4] = [0x00, 0x01, 0x06, 0x08]; // X, Y, HWHEEL, WHEEL

// uinput ioctl constants
const UI_SET_EVBIT: libc::c_ulong = 0x40045564;   // _IOW('U', 100, int)
const UI_SET_KEYBIT: libc::c_ulong = 0x40045565;  // _IOW('U', 101, int)
const UI_SET_RELBIT: libc::c_ulong = 0x40045566;  // _IOW('U', 102, int)
const UI_DEV_CREATE: libc::c_ulong = 0x5501;      // _IO('U', 1)
const UI_DEV_DESTROY: libc::c_ulong = 0x5502;     // _IO('U', 2)

/// How often the injection loop looks at its stop flag
const POLL_TIMEOUT_MS: libc::c_int = 100;

/// A replaced injection may still hold its grab for one poll interval
const GRAB_ATTEMPTS: u32 = 5;

#[derive(Error, Debug)]
pub enum InjectorError {
    #[error("uinput: {0}")]
    Uinput(String),
    #[error("failed to open {0}: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("failed to grab {0}: {1}")]
    Grab(PathBuf, std::io::Error),
    #[error("device group {0} has no usable event nodes")]
    NoDevices(String),
}

/// A running injection into one device group
pub trait Injection: Send + Sync {
    /// Deliver the stop signal. Returns without waiting for the task to end.
    fn stop(&mut self);

    /// True once the injection ended, whether stopped or on its own
    /// (device unplugged, read or write error).
    fn is_finished(&self) -> bool;
}

/// Starts injections. Swapped for a recording double in tests.
#[async_trait::async_trait]
pub trait InjectorFactory: Send + Sync {
    async fn start(
        &self,
        group: &DeviceGroup,
        preset_id: &PresetId,
        preset: Preset,
    ) -> Result<Box<dyn Injection>, InjectorError>;
}

/// Linux input_event structure
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct InputEvent {
    time: libc::timeval,
    type_: u16,
    code: u16,
    value: i32,
}

/// uinput_user_dev structure for device setup
#[repr(C)]
struct UinputUserDev {
    name: [u8; 80],
    id: InputId,
    ff_effects_max: u32,
    absmax: [i32; 64],
    absmin: [i32; 64],
    absfuzz: [i32; 64],
    absflat: [i32; 64],
}

#[repr(C)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

/// Virtual keyboard + mouse that remapped events are written to
pub struct UinputDevice {
    fd: RawFd,
}

impl UinputDevice {
    /// Open /dev/uinput and create a virtual device called `name`
    pub fn create(name: &str) -> Result<Self, InjectorError> {
        let uinput_file = OpenOptions::new()
            .write(true)
            .open("/dev/uinput")
            .map_err(|e| {
                error!("Failed to open /dev/uinput: {}. Ensure you have root privileges and uinput module is loaded.", e);
                InjectorError::Uinput(format!("failed to open /dev/uinput: {}", e))
            })?;

        // Drop destroys the device and closes the fd
        let device = Self { fd: uinput_file.into_raw_fd() };
        let fd = device.fd;

        unsafe {
            for ev in [EV_KEY, EV_REL, EV_SYN] {
                if libc::ioctl(fd, UI_SET_EVBIT, ev as libc::c_int) < 0 {
                    return Err(InjectorError::Uinput(format!("failed to set event bit {}", ev)));
                }
            }

            for key in 0..=KEY_MAX {
                if libc::ioctl(fd, UI_SET_KEYBIT, key as libc::c_int) < 0 {
                    debug!("Failed to set keybit for key {}", key);
                }
            }

            for axis in REL_AXES {
                if libc::ioctl(fd, UI_SET_RELBIT, axis as libc::c_int) < 0 {
                    warn!("Failed to set relbit {}", axis);
                }
            }
        }

        let mut dev: UinputUserDev = unsafe { mem::zeroed() };
        let bytes = name.as_bytes();
        let len = bytes.len().min(dev.name.len() - 1);
        dev.name[..len].copy_from_slice(&bytes[..len]);
        dev.id.bustype = 0x06; // BUS_VIRTUAL
        dev.id.vendor = 0x0000;
        dev.id.product = 0x0000;
        dev.id.version = 1;

        unsafe {
            let dev_ptr = &dev as *const UinputUserDev as *const libc::c_void;
            if libc::write(fd, dev_ptr, mem::size_of::<UinputUserDev>()) < 0 {
                return Err(InjectorError::Uinput("failed to write uinput device structure".into()));
            }

            if libc::ioctl(fd, UI_DEV_CREATE) < 0 {
                return Err(InjectorError::Uinput("failed to create uinput device".into()));
            }
        }

        info!("Created uinput virtual device: {}", name);
        Ok(device)
    }

    /// Write an input event to the uinput device
    pub fn write_event(&self, type_: u16, code: u16, value: i32) -> std::io::Result<()> {
        let mut event: InputEvent = unsafe { mem::zeroed() };

        unsafe {
            libc::gettimeofday(&mut event.time, std::ptr::null_mut());
        }

        event.type_ = type_;
        event.code = code;
        event.value = value;

        let written = unsafe {
            libc::write(
                self.fd,
                &event as *const InputEvent as *const libc::c_void,
                mem::size_of::<InputEvent>(),
            )
        };
        if written < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn sync(&self) -> std::io::Result<()> {
        self.write_event(EV_SYN, SYN_REPORT, 0)
    }
}

impl Drop for UinputDevice {
    fn drop(&mut self) {
        debug!("Destroying uinput virtual device");
        unsafe {
            libc::ioctl(self.fd, UI_DEV_DESTROY);
            libc::close(self.fd);
        }
    }
}

/// Handle of an injection running on a blocking task
pub struct EvdevInjection {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Injection for EvdevInjection {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // the task notices the flag within POLL_TIMEOUT_MS and ungrabs
        self.task.take();
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
            || self.task.as_ref().map_or(false, |task| task.is_finished())
    }
}

impl Drop for EvdevInjection {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Grabs the group's event nodes and re-emits their events, translated by
/// the preset, through a uinput device
#[derive(Debug, Clone, Copy, Default)]
pub struct EvdevInjectorFactory;

impl EvdevInjectorFactory {
    pub fn new() -> Self {
        Self
    }

    fn grab_all(group: &DeviceGroup) -> Result<Vec<EvdevDevice>, InjectorError> {
        let mut devices = Vec::new();
        for path in &group.paths {
            let mut device = match EvdevDevice::open(path) {
                Ok(device) => device,
                Err(e) => {
                    // a node can vanish between scan and start, the rest may still work
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            device.grab().map_err(|e| InjectorError::Grab(path.clone(), e))?;
            debug!("Grabbed {}", path.display());
            devices.push(device);
        }

        if devices.is_empty() {
            return Err(InjectorError::NoDevices(group.key.to_string()));
        }
        Ok(devices)
    }
}

#[async_trait::async_trait]
impl InjectorFactory for EvdevInjectorFactory {
    async fn start(
        &self,
        group: &DeviceGroup,
        preset_id: &PresetId,
        preset: Preset,
    ) -> Result<Box<dyn Injection>, InjectorError> {
        let mut attempt = 1;
        let devices = loop {
            match Self::grab_all(group) {
                Err(InjectorError::Grab(path, e))
                    if e.raw_os_error() == Some(libc::EBUSY) && attempt < GRAB_ATTEMPTS =>
                {
                    debug!("{} is busy, retrying", path.display());
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64)).await;
                }
                result => break result?,
            }
        };
        let uinput = UinputDevice::create(&format!("{} {}", VIRTUAL_DEVICE_NAME, group.key))?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let finished = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&finished);
        let key = group.key.to_string();
        info!("Injecting preset {} into {}", preset_id, key);

        let task = tokio::task::spawn_blocking(move || {
            run_injection(&key, devices, &uinput, &preset, &flag);
            done.store(true, Ordering::SeqCst);
        });

        Ok(Box::new(EvdevInjection {
            stop,
            finished,
            task: Some(task),
        }))
    }
}

fn run_injection(
    key: &str,
    mut devices: Vec<EvdevDevice>,
    uinput: &UinputDevice,
    preset: &Preset,
    stop: &AtomicBool,
) {
    let mut fds: Vec<libc::pollfd> = devices
        .iter()
        .map(|d| libc::pollfd {
            fd: d.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    'outer: while !stop.load(Ordering::SeqCst) {
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!("poll failed for {}: {}", key, err);
            break;
        }

        for (pollfd, device) in fds.iter().zip(devices.iter_mut()) {
            if pollfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                warn!("Event node of {} went away", key);
                break 'outer;
            }
            if pollfd.revents & libc::POLLIN == 0 {
                continue;
            }

            let events = match device.fetch_events() {
                Ok(events) => events,
                Err(e) => {
                    error!("Error reading events of {}: {}", key, e);
                    break 'outer;
                }
            };

            for event in events {
                let type_ = event.event_type().0;
                // the virtual device generates its own MSC_SCAN
                if type_ == EV_MSC {
                    continue;
                }
                let code = if type_ == EV_KEY {
                    preset.translate(event.code())
                } else {
                    event.code()
                };
                if let Err(e) = uinput.write_event(type_, code, event.value()) {
                    error!("Failed to write event for {}: {}", key, e);
                    break 'outer;
                }
            }
        }
    }

    for device in devices.iter_mut() {
        if let Err(e) = device.ungrab() {
            // the node is usually gone already when this fails
            debug!("Failed to ungrab device of {}: {}", key, e);
        }
    }
    info!("Injection into {} stopped", key);
}
