//! The virtual keyboard the daemon emits rewritten events to.

use anyhow::Context;
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AbsInfo, AbsoluteAxisType, AttributeSet, EventType, InputEvent, Key, RelativeAxisType, UinputAbsSetup};

/// Name the virtual sink advertises to the OS.
///
/// The device backend sees the sink like any other input device; this
/// name is how the dispatcher recognizes and skips it.
pub const VIRTUAL_SINK_NAME: &str = "keywarp virtual keyboard";

/// Where rewritten events go.
///
/// The sink exposes no state; the dispatcher keeps its own mirror of
/// which keys it believes are held. Emission failures are logged and
/// swallowed because there is nothing the caller could do about them.
pub trait EventSink {
    fn send_key(&mut self, code: u8, pressed: bool);
    fn motion_rel(&mut self, dx: i32, dy: i32);
    fn motion_abs(&mut self, x: i32, y: i32);
    fn scroll(&mut self, dx: i32, dy: i32);
}

/// A uinput-backed [`EventSink`].
pub struct VirtualSink {
    device: VirtualDevice,
}

impl VirtualSink {
    pub fn new() -> anyhow::Result<Self> {
        let mut keys = AttributeSet::<Key>::new();
        for code in 1..248u16 {
            keys.insert(Key::new(code));
        }

        let mut axes = AttributeSet::<RelativeAxisType>::new();
        axes.insert(RelativeAxisType::REL_X);
        axes.insert(RelativeAxisType::REL_Y);
        axes.insert(RelativeAxisType::REL_WHEEL);
        axes.insert(RelativeAxisType::REL_HWHEEL);

        let abs = AbsInfo::new(0, 0, 65535, 0, 0, 0);
        let abs_x = UinputAbsSetup::new(AbsoluteAxisType::ABS_X, abs);
        let abs_y = UinputAbsSetup::new(AbsoluteAxisType::ABS_Y, abs);

        let device = VirtualDeviceBuilder::new()
            .context("error opening /dev/uinput")?
            .name(VIRTUAL_SINK_NAME)
            .with_keys(&keys)
            .context("error setting key capabilities")?
            .with_relative_axes(&axes)
            .context("error setting relative axes")?
            .with_absolute_axis(&abs_x)
            .context("error setting ABS_X")?
            .with_absolute_axis(&abs_y)
            .context("error setting ABS_Y")?
            .build()
            .context("error creating the virtual keyboard")?;

        Ok(Self { device })
    }

    fn emit(&mut self, events: &[InputEvent]) {
        if let Err(err) = self.device.emit(events) {
            warn!("error writing to the virtual keyboard: {err}");
        }
    }
}

impl EventSink for VirtualSink {
    fn send_key(&mut self, code: u8, pressed: bool) {
        self.emit(&[InputEvent::new(
            EventType::KEY,
            u16::from(code),
            i32::from(pressed),
        )]);
    }

    fn motion_rel(&mut self, dx: i32, dy: i32) {
        self.emit(&[
            InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_X.0, dx),
            InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_Y.0, dy),
        ]);
    }

    fn motion_abs(&mut self, x: i32, y: i32) {
        self.emit(&[
            InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_X.0, x),
            InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_Y.0, y),
        ]);
    }

    fn scroll(&mut self, dx: i32, dy: i32) {
        let mut events = Vec::with_capacity(2);
        if dy != 0 {
            events.push(InputEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_WHEEL.0,
                dy,
            ));
        }
        if dx != 0 {
            events.push(InputEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_HWHEEL.0,
                dx,
            ));
        }
        self.emit(&events);
    }
}
