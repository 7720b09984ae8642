//! Physical input devices and their evdev backend.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Context;
use bitflags::bitflags;
use calloop::RegistrationToken;
use evdev::{AbsoluteAxisType, InputEventKind, Key, RelativeAxisType};

use crate::keyboard::Keyboard;

bitflags! {
    /// What kinds of events a device can produce.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities : u8 {
        const KEYBOARD = 1;
        const MOUSE = 1 << 1;
        const MOUSE_ABS = 1 << 2;
    }
}

/// A decoded event from a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Key { code: u8, pressed: bool },
    RelMotion { dx: i32, dy: i32 },
    AbsMotion { x: i32, y: i32 },
    Scroll { dx: i32, dy: i32 },
}

/// One attached input device.
///
/// The evdev handle is absent for synthetic devices used in tests; for
/// those, grabs trivially succeed and no events can be fetched.
pub struct Device {
    pub path: PathBuf,
    pub name: String,
    pub vendor: u16,
    pub product: u16,
    pub capabilities: Capabilities,
    /// The interpreter this device feeds, if any. Non-empty exactly when
    /// the device is grabbed.
    pub bound: Option<Rc<RefCell<Keyboard>>>,
    /// Registration of this device's fd source on the event loop.
    pub token: Option<RegistrationToken>,
    handle: Option<evdev::Device>,
    /// Last seen absolute position, so per-axis events can be reported
    /// as full coordinates.
    last_abs: (i32, i32),
}

impl Device {
    /// Opens an evdev device node.
    ///
    /// Returns `Ok(None)` for devices without any capability we handle
    /// (accelerometers, switches and the like).
    pub fn open(path: &Path) -> anyhow::Result<Option<Self>> {
        let handle = evdev::Device::open(path)
            .with_context(|| format!("error opening {}", path.display()))?;

        let capabilities = probe_capabilities(&handle);
        if capabilities.is_empty() {
            return Ok(None);
        }

        set_nonblocking(handle.as_raw_fd());

        let id = handle.input_id();
        Ok(Some(Self {
            path: path.to_owned(),
            name: handle.name().unwrap_or("unknown").to_owned(),
            vendor: id.vendor(),
            product: id.product(),
            capabilities,
            bound: None,
            token: None,
            handle: Some(handle),
            last_abs: (0, 0),
        }))
    }

    /// Creates a backend-less device for tests.
    #[cfg(test)]
    pub fn synthetic(name: &str, vendor: u16, product: u16, capabilities: Capabilities) -> Self {
        Self {
            path: PathBuf::from(format!("/dev/input/synthetic-{vendor:04x}-{product:04x}")),
            name: name.to_owned(),
            vendor,
            product,
            capabilities,
            bound: None,
            token: None,
            handle: None,
            last_abs: (0, 0),
        }
    }

    /// The packed `(vendor << 16) | product` id used for matching.
    pub fn id(&self) -> u32 {
        u32::from(self.vendor) << 16 | u32::from(self.product)
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.handle.as_ref().map(|h| h.as_raw_fd())
    }

    /// Grabs the device exclusively, so the OS stops delivering its
    /// events to other consumers.
    pub fn grab(&mut self) -> io::Result<()> {
        match &mut self.handle {
            Some(handle) => handle.grab(),
            None => Ok(()),
        }
    }

    pub fn ungrab(&mut self) {
        if let Some(handle) = &mut self.handle {
            if let Err(err) = handle.ungrab() {
                debug!("error ungrabbing {}: {err}", self.path.display());
            }
        }
    }

    /// Drains all readable events, decoded into [`DeviceEvent`]s.
    ///
    /// Autorepeat key events and axes we do not forward are dropped
    /// here, before they reach the dispatcher.
    pub fn poll_events(&mut self) -> io::Result<Vec<DeviceEvent>> {
        let Some(handle) = &mut self.handle else {
            return Ok(Vec::new());
        };

        let mut decoded = Vec::new();
        loop {
            let events = match handle.fetch_events() {
                Ok(events) => events,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            };

            for event in events {
                let value = event.value();
                match event.kind() {
                    InputEventKind::Key(key) => {
                        let code = key.code();
                        // Codes past the u8 range (mouse buttons and
                        // friends) and autorepeats are not remapped.
                        // 255 is reserved for the synthetic scroll
                        // button and must not arrive from hardware.
                        if code == 0 || code >= u16::from(u8::MAX) || value > 1 {
                            continue;
                        }
                        decoded.push(DeviceEvent::Key {
                            code: code as u8,
                            pressed: value == 1,
                        });
                    }
                    InputEventKind::RelAxis(axis) => match axis {
                        RelativeAxisType::REL_X => {
                            decoded.push(DeviceEvent::RelMotion { dx: value, dy: 0 });
                        }
                        RelativeAxisType::REL_Y => {
                            decoded.push(DeviceEvent::RelMotion { dx: 0, dy: value });
                        }
                        RelativeAxisType::REL_WHEEL => {
                            decoded.push(DeviceEvent::Scroll { dx: 0, dy: value });
                        }
                        RelativeAxisType::REL_HWHEEL => {
                            decoded.push(DeviceEvent::Scroll { dx: value, dy: 0 });
                        }
                        _ => {}
                    },
                    InputEventKind::AbsAxis(axis) => match axis {
                        AbsoluteAxisType::ABS_X => {
                            self.last_abs.0 = value;
                            let (x, y) = self.last_abs;
                            decoded.push(DeviceEvent::AbsMotion { x, y });
                        }
                        AbsoluteAxisType::ABS_Y => {
                            self.last_abs.1 = value;
                            let (x, y) = self.last_abs;
                            decoded.push(DeviceEvent::AbsMotion { x, y });
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }
        }

        Ok(decoded)
    }
}

/// Opens every device node under `/dev/input` we can read.
pub fn enumerate(dir: &Path) -> Vec<Device> {
    let mut devices = Vec::new();

    for path in event_nodes(dir) {
        match Device::open(&path) {
            Ok(Some(device)) => devices.push(device),
            Ok(None) => {}
            Err(err) => debug!("skipping {}: {err:#}", path.display()),
        }
    }

    devices
}

/// Lists the `event*` nodes under an input device directory.
pub fn event_nodes(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("event"))
        })
        .collect()
}

fn probe_capabilities(device: &evdev::Device) -> Capabilities {
    let mut caps = Capabilities::empty();

    // Letter keys distinguish real keyboards from headsets and power
    // buttons that also advertise EV_KEY.
    if device
        .supported_keys()
        .is_some_and(|keys| keys.contains(Key::KEY_A))
    {
        caps |= Capabilities::KEYBOARD;
    }
    if device
        .supported_relative_axes()
        .is_some_and(|axes| axes.contains(RelativeAxisType::REL_X))
    {
        caps |= Capabilities::MOUSE;
    }
    if device
        .supported_absolute_axes()
        .is_some_and(|axes| axes.contains(AbsoluteAxisType::ABS_X))
    {
        caps |= Capabilities::MOUSE_ABS;
    }

    caps
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}
