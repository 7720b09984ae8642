//! The event dispatcher.
//!
//! Owns every piece of daemon state: the virtual sink and its mirror,
//! the device table, the configuration registry, and the layer-listener
//! set. The event loop integration in [`crate::daemon`] translates
//! readiness into calls on this type; everything here runs on the one
//! and only thread.

use std::cell::RefCell;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use keywarp_config::keys::EXTERNAL_MOUSE_BUTTON;
use keywarp_config::{Config, Keymap, MatchRank};
use keywarp_ipc::{Message, MessageType, ProtocolError, DATA_MAX, FRAME_LEN};

use crate::device::{Capabilities, Device, DeviceEvent};
use crate::keyboard::{Keyboard, Output};
use crate::sink::{EventSink, VIRTUAL_SINK_NAME};
use crate::utils::get_monotonic_time;

/// Static upper bound on attached devices.
pub const MAX_DEVICES: usize = 64;
/// Static upper bound on layer-state subscribers.
pub const MAX_LISTENERS: usize = 32;

/// How long a slow subscriber gets to relieve back pressure before its
/// write fails and it is dropped.
const LISTENER_SEND_TIMEOUT: Duration = Duration::from_millis(50);
/// How long a freshly accepted control client gets to send its request.
const CLIENT_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Which keycodes the daemon believes are currently held on the sink.
///
/// Mutated only by the emission wrapper and the drain, so it stays in
/// lockstep with what actually went to the sink.
pub struct SinkMirror([bool; 256]);

impl SinkMirror {
    fn new() -> Self {
        Self([false; 256])
    }

    pub fn is_held(&self, code: u8) -> bool {
        self.0[usize::from(code)]
    }

    pub fn is_clear(&self) -> bool {
        self.0.iter().all(|held| !held)
    }

    fn set(&mut self, code: u8, held: bool) {
        self.0[usize::from(code)] = held;
    }
}

/// Layer-state subscribers.
pub struct ListenerSet {
    streams: Vec<UnixStream>,
}

impl ListenerSet {
    fn new() -> Self {
        Self {
            streams: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    fn add(&mut self, mut con: UnixStream) {
        if self.streams.len() == MAX_LISTENERS {
            let _ = con.write_all(b"Max listeners exceeded\n");
            return;
        }

        if let Err(err) = con.set_write_timeout(Some(LISTENER_SEND_TIMEOUT)) {
            warn!("error setting listener send timeout: {err}");
        }

        self.streams.push(con);
    }

    fn broadcast(&mut self, name: &str, active: bool) {
        if self.streams.is_empty() {
            return;
        }

        let line = format!("{}{name}\n", if active { '+' } else { '-' });
        self.streams.retain_mut(|stream| {
            match stream.write_all(line.as_bytes()) {
                Ok(()) => true,
                Err(err) => {
                    debug!("dropping layer listener: {err}");
                    false
                }
            }
        });
    }
}

/// One configuration file with its interpreter.
pub struct ConfigEntry {
    pub path: PathBuf,
    pub config: Config,
    pub kbd: Rc<RefCell<Keyboard>>,
}

/// Capability handed to interpreters: key emissions go through the sink
/// mirror, layer transitions fan out to the listeners.
struct EmitCtx<'a> {
    sink: &'a mut dyn EventSink,
    mirror: &'a mut SinkMirror,
    listeners: &'a mut ListenerSet,
}

impl Output for EmitCtx<'_> {
    fn emit_key(&mut self, code: u8, pressed: bool) {
        self.mirror.set(code, pressed);
        self.sink.send_key(code, pressed);
    }

    fn layer_changed(&mut self, name: &str, active: bool) {
        self.listeners.broadcast(name, active);
    }
}

pub struct Dispatcher {
    sink: Box<dyn EventSink>,
    mirror: SinkMirror,
    registry: Vec<ConfigEntry>,
    devices: Vec<Device>,
    listeners: ListenerSet,
    /// The interpreter that last saw a device event. Timer ticks route
    /// here, because the expired timer was necessarily armed by it.
    last_active: Option<Rc<RefCell<Keyboard>>>,
    config_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(sink: Box<dyn EventSink>, config_dir: PathBuf) -> Self {
        Self {
            sink,
            mirror: SinkMirror::new(),
            registry: Vec::new(),
            devices: Vec::new(),
            listeners: ListenerSet::new(),
            last_active: None,
            config_dir,
        }
    }

    pub fn mirror(&self) -> &SinkMirror {
        &self.mirror
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_index(&self, path: &Path) -> Option<usize> {
        self.devices.iter().position(|dev| dev.path == path)
    }

    pub fn device(&self, idx: usize) -> &Device {
        &self.devices[idx]
    }

    pub fn device_mut(&mut self, idx: usize) -> &mut Device {
        &mut self.devices[idx]
    }

    /// Adds a device to the table and matches it against the registry.
    ///
    /// Our own virtual keyboard shows up through the backend like any
    /// other device; it is recognized by name and never added. Returns
    /// whether the device entered the table.
    pub fn add_device(&mut self, device: Device) -> bool {
        if device.name == VIRTUAL_SINK_NAME {
            return false;
        }

        assert!(self.devices.len() < MAX_DEVICES, "device table overflow");
        self.devices.push(device);
        self.manage_device(self.devices.len() - 1);
        true
    }

    /// Removes a device by its stable path, preserving the relative
    /// order of the survivors. No ungrab is issued; the device node is
    /// already gone.
    pub fn remove_device(&mut self, path: &Path) -> Option<Device> {
        let pos = self.device_index(path)?;
        let device = self.devices.remove(pos);

        info!(
            "removed  {:04x}:{:04x}  ({})",
            device.vendor, device.product, device.name
        );
        Some(device)
    }

    /// Scores a packed device id against every registry entry.
    ///
    /// The highest rank wins; ties go to the first-scanned entry.
    pub fn lookup_match(&self, id: u32) -> (MatchRank, Option<usize>) {
        let mut best_rank = MatchRank::None;
        let mut best = None;

        for (idx, entry) in self.registry.iter().enumerate() {
            let rank = entry.config.check_match(id);
            if rank > best_rank {
                best_rank = rank;
                best = Some(idx);
            }
        }

        (best_rank, best)
    }

    /// (Re-)binds one device according to the current registry.
    fn manage_device(&mut self, idx: usize) {
        let (rank, entry_idx) = self.lookup_match(self.devices[idx].id());

        let caps = self.devices[idx].capabilities;
        let bind = match rank {
            MatchRank::Exact => caps.intersects(
                Capabilities::KEYBOARD | Capabilities::MOUSE | Capabilities::MOUSE_ABS,
            ),
            MatchRank::Wildcard => caps.contains(Capabilities::KEYBOARD),
            MatchRank::None => false,
        };

        let device = &mut self.devices[idx];
        if bind {
            let entry = &self.registry[entry_idx.unwrap()];

            if let Err(err) = device.grab() {
                warn!("failed to grab {}: {err}", device.path.display());
                device.bound = None;
                return;
            }

            info!(
                "match    {:04x}:{:04x}  {}\t({})",
                device.vendor,
                device.product,
                entry.path.display(),
                device.name
            );
            device.bound = Some(entry.kbd.clone());
        } else {
            device.bound = None;
            device.ungrab();
            info!(
                "ignoring {:04x}:{:04x}  ({})",
                device.vendor, device.product, device.name
            );
        }
    }

    /// Feeds one decoded device event through the bound interpreter and
    /// the sink. Returns the interpreter's next-wakeup hint in ms.
    pub fn handle_device_event(&mut self, idx: usize, event: DeviceEvent) -> u64 {
        let Some(kbd) = self.devices[idx].bound.clone() else {
            return 0;
        };
        self.last_active = Some(kbd.clone());

        match event {
            DeviceEvent::Key { code, pressed } => {
                let now = get_monotonic_time();
                let mut ctx = EmitCtx {
                    sink: &mut *self.sink,
                    mirror: &mut self.mirror,
                    listeners: &mut self.listeners,
                };
                kbd.borrow_mut().process_key_event(&mut ctx, code, pressed, now)
            }
            DeviceEvent::RelMotion { dx, dy } => {
                self.sink.motion_rel(dx, dy);
                0
            }
            DeviceEvent::AbsMotion { x, y } => {
                self.sink.motion_abs(x, y);
                0
            }
            DeviceEvent::Scroll { dx, dy } => {
                // Scroll counts as a mouse button so oneshot and
                // tap-then-scroll state gets cleared.
                let now = get_monotonic_time();
                {
                    let mut ctx = EmitCtx {
                        sink: &mut *self.sink,
                        mirror: &mut self.mirror,
                        listeners: &mut self.listeners,
                    };
                    let mut kbd = kbd.borrow_mut();
                    kbd.process_key_event(&mut ctx, EXTERNAL_MOUSE_BUTTON, true, now);
                    kbd.process_key_event(&mut ctx, EXTERNAL_MOUSE_BUTTON, false, now);
                }
                self.sink.scroll(dx, dy);
                0
            }
        }
    }

    /// Services the expired timer of whichever interpreter is timing.
    pub fn tick(&mut self) -> u64 {
        let Some(kbd) = self.last_active.clone() else {
            return 0;
        };

        let now = get_monotonic_time();
        let mut ctx = EmitCtx {
            sink: &mut *self.sink,
            mirror: &mut self.mirror,
            listeners: &mut self.listeners,
        };
        let result = kbd.borrow_mut().process_key_event(&mut ctx, 0, false, now);
        result
    }

    /// Rebuilds the registry from the configuration directory and
    /// re-matches every device.
    ///
    /// Atomic from any client's perspective: no device event is
    /// processed in between. Parse failures are returned as errors and
    /// terminate the daemon; a partial registry would silently mis-bind
    /// devices.
    pub fn reload(&mut self) -> anyhow::Result<()> {
        self.registry.clear();
        self.last_active = None;

        self.load_configs()?;

        for idx in 0..self.devices.len() {
            self.manage_device(idx);
        }

        self.drain_mirror();
        Ok(())
    }

    fn load_configs(&mut self) -> anyhow::Result<()> {
        let dir = fs::read_dir(&self.config_dir)
            .with_context(|| format!("error opening {}", self.config_dir.display()))?;

        for entry in dir {
            let entry = entry.context("error reading configuration directory")?;
            if entry.file_type().map_or(false, |ty| ty.is_dir()) {
                continue;
            }

            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "conf") {
                continue;
            }

            info!("parsing {}", path.display());
            let config = Config::load(&path)
                .map_err(|err| anyhow!("failed to parse {}:\n{:?}", path.display(), err))?;

            let kbd = Keyboard::new(Keymap::from_config(&config));
            self.registry.push(ConfigEntry {
                path,
                config,
                kbd: Rc::new(RefCell::new(kbd)),
            });
        }

        Ok(())
    }

    /// Releases every key the mirror believes is held, in ascending
    /// keycode order, leaving the sink all-released.
    fn drain_mirror(&mut self) {
        for code in 0..=u8::MAX {
            if self.mirror.is_held(code) {
                self.mirror.set(code, false);
                self.sink.send_key(code, false);
            }
        }
    }

    /// Offers a binding expression to every interpreter.
    ///
    /// Succeeds if any accepted it; otherwise reports the last error.
    fn bind(&mut self, expr: &str) -> Result<(), String> {
        let mut success = false;
        let mut last_err = None;

        for entry in &self.registry {
            match entry.kbd.borrow_mut().eval(expr) {
                Ok(()) => success = true,
                Err(err) => last_err = Some(err.to_string()),
            }
        }

        if success {
            Ok(())
        } else {
            Err(last_err.unwrap_or_else(|| String::from("no configurations loaded")))
        }
    }

    /// Handles one control-channel client, synchronously.
    ///
    /// The connection is closed when `con` drops, except for listen
    /// requests, which hand the stream over to the listener set. The
    /// only error this returns is a failed reload, which is fatal.
    pub fn handle_client(&mut self, mut con: UnixStream) -> anyhow::Result<()> {
        if let Err(err) = con.set_read_timeout(Some(CLIENT_RECV_TIMEOUT)) {
            warn!("error setting control read timeout: {err}");
        }

        let mut frame = Box::new([0u8; FRAME_LEN]);
        if let Err(err) = con.read_exact(&mut frame[..]) {
            warn!("error reading control request: {err}");
            return Ok(());
        }

        let request = match Message::decode(&frame) {
            Ok(request) => request,
            Err(ProtocolError::UnknownType(_)) => {
                send_fail(&mut con, "Unknown command");
                return Ok(());
            }
            Err(err) => {
                send_fail(&mut con, &err.to_string());
                return Ok(());
            }
        };

        match request.ty {
            MessageType::Reload => {
                self.reload()?;
                send_success(&mut con);
            }
            MessageType::Bind => {
                let expr = request.text();
                match self.bind(expr.trim()) {
                    Ok(()) => send_success(&mut con),
                    Err(err) => {
                        warn!("bind rejected: {err}");
                        send_fail(&mut con, &err);
                    }
                }
            }
            MessageType::LayerListen => self.listeners.add(con),
            MessageType::Success | MessageType::Fail => send_fail(&mut con, "Unknown command"),
        }

        Ok(())
    }
}

fn send_success(con: &mut UnixStream) {
    send_reply(con, Message::with_text(MessageType::Success, "Success"));
}

fn send_fail(con: &mut UnixStream, text: &str) {
    let data = text.as_bytes();
    let data = &data[..data.len().min(DATA_MAX)];
    send_reply(
        con,
        Message {
            ty: MessageType::Fail,
            data: data.to_vec(),
        },
    );
}

fn send_reply(con: &mut UnixStream, reply: Message) {
    let frame = reply.encode().expect("reply payloads are bounded");
    if let Err(err) = con.write_all(&frame[..]) {
        debug!("error writing control reply: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Read;
    use std::process;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SinkOp {
        Key(u8, bool),
        Rel(i32, i32),
        Abs(i32, i32),
        Scroll(i32, i32),
    }

    #[derive(Clone, Default)]
    struct TestSink(Rc<RefCell<Vec<SinkOp>>>);

    impl EventSink for TestSink {
        fn send_key(&mut self, code: u8, pressed: bool) {
            self.0.borrow_mut().push(SinkOp::Key(code, pressed));
        }

        fn motion_rel(&mut self, dx: i32, dy: i32) {
            self.0.borrow_mut().push(SinkOp::Rel(dx, dy));
        }

        fn motion_abs(&mut self, x: i32, y: i32) {
            self.0.borrow_mut().push(SinkOp::Abs(x, y));
        }

        fn scroll(&mut self, dx: i32, dy: i32) {
            self.0.borrow_mut().push(SinkOp::Scroll(dx, dy));
        }
    }

    struct TestDir(PathBuf);

    impl TestDir {
        fn new(configs: &[(&str, &str)]) -> Self {
            static COUNTER: AtomicUsize = AtomicUsize::new(0);
            let dir = std::env::temp_dir().join(format!(
                "keywarp-test-{}-{}",
                process::id(),
                COUNTER.fetch_add(1, Ordering::SeqCst),
            ));
            fs::create_dir_all(&dir).unwrap();

            for (name, text) in configs {
                fs::write(dir.join(name), text).unwrap();
            }

            Self(dir)
        }
    }

    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn dispatcher(configs: &[(&str, &str)]) -> (Dispatcher, Rc<RefCell<Vec<SinkOp>>>, TestDir) {
        let sink = TestSink::default();
        let ops = sink.0.clone();
        let dir = TestDir::new(configs);
        let mut dispatcher = Dispatcher::new(Box::new(sink), dir.0.clone());
        dispatcher.reload().unwrap();
        (dispatcher, ops, dir)
    }

    fn keyboard_device(vendor: u16, product: u16) -> Device {
        Device::synthetic("test keyboard", vendor, product, Capabilities::KEYBOARD)
    }

    fn bound_entry_path(dispatcher: &Dispatcher, idx: usize) -> Option<PathBuf> {
        let bound = dispatcher.device(idx).bound.as_ref()?;
        dispatcher
            .registry
            .iter()
            .find(|entry| Rc::ptr_eq(&entry.kbd, bound))
            .map(|entry| entry.path.clone())
    }

    #[test]
    fn virtual_sink_never_enters_the_table() {
        let (mut dispatcher, _, _dir) = dispatcher(&[]);

        let device =
            Device::synthetic(VIRTUAL_SINK_NAME, 0x1234, 0x5678, Capabilities::KEYBOARD);
        assert!(!dispatcher.add_device(device));
        assert_eq!(dispatcher.device_count(), 0);
    }

    #[test]
    fn explicit_id_beats_wildcard_and_survives_reload() {
        let (mut dispatcher, _, _dir) = dispatcher(&[
            ("c1.conf", r#"devices "046d:c52b""#),
            ("c2.conf", r#"devices "*""#),
        ]);

        dispatcher.add_device(keyboard_device(0x046d, 0xc52b));
        assert!(bound_entry_path(&dispatcher, 0)
            .unwrap()
            .ends_with("c1.conf"));

        dispatcher.reload().unwrap();
        assert_eq!(dispatcher.device_count(), 1);
        assert!(bound_entry_path(&dispatcher, 0)
            .unwrap()
            .ends_with("c1.conf"));
        assert!(dispatcher.mirror().is_clear());
    }

    #[test]
    fn wildcard_binds_keyboards_only() {
        let (mut dispatcher, _, _dir) = dispatcher(&[("all.conf", r#"devices "*""#)]);

        dispatcher.add_device(keyboard_device(0x1111, 0x0001));
        dispatcher.add_device(Device::synthetic(
            "test mouse",
            0x2222,
            0x0002,
            Capabilities::MOUSE,
        ));

        assert!(dispatcher.device(0).bound.is_some());
        assert!(dispatcher.device(1).bound.is_none());
    }

    #[test]
    fn explicit_id_binds_pointer_devices_too() {
        let (mut dispatcher, _, _dir) =
            dispatcher(&[("mouse.conf", r#"devices "2222:0002""#)]);

        dispatcher.add_device(Device::synthetic(
            "test mouse",
            0x2222,
            0x0002,
            Capabilities::MOUSE,
        ));
        assert!(dispatcher.device(0).bound.is_some());
    }

    #[test]
    fn lookup_match_is_deterministic() {
        let (dispatcher, _, _dir) = dispatcher(&[
            ("c1.conf", r#"devices "046d:c52b""#),
            ("c2.conf", r#"devices "*""#),
        ]);

        let first = dispatcher.lookup_match(0x046d_c52b);
        for _ in 0..16 {
            assert_eq!(dispatcher.lookup_match(0x046d_c52b), first);
        }
    }

    #[test]
    fn events_from_unbound_devices_are_dropped() {
        let (mut dispatcher, ops, _dir) = dispatcher(&[]);

        dispatcher.add_device(keyboard_device(0x1111, 0x0001));
        assert!(dispatcher.device(0).bound.is_none());

        dispatcher.handle_device_event(0, DeviceEvent::Key { code: 30, pressed: true });
        assert_eq!(*ops.borrow(), vec![]);
    }

    #[test]
    fn reload_releases_held_keys() {
        let (mut dispatcher, ops, _dir) = dispatcher(&[("all.conf", r#"devices "*""#)]);

        dispatcher.add_device(keyboard_device(0x1111, 0x0001));
        dispatcher.handle_device_event(0, DeviceEvent::Key { code: 30, pressed: true });

        assert!(dispatcher.mirror().is_held(30));
        assert_eq!(*ops.borrow(), vec![SinkOp::Key(30, true)]);

        dispatcher.reload().unwrap();
        assert!(dispatcher.mirror().is_clear());
        assert_eq!(
            *ops.borrow(),
            vec![SinkOp::Key(30, true), SinkOp::Key(30, false)]
        );
    }

    #[test]
    fn pointer_events_forward_to_the_sink() {
        let (mut dispatcher, ops, _dir) =
            dispatcher(&[("mouse.conf", r#"devices "2222:0002""#)]);

        dispatcher.add_device(Device::synthetic(
            "test mouse",
            0x2222,
            0x0002,
            Capabilities::MOUSE | Capabilities::MOUSE_ABS,
        ));

        dispatcher.handle_device_event(0, DeviceEvent::RelMotion { dx: 3, dy: -1 });
        dispatcher.handle_device_event(0, DeviceEvent::AbsMotion { x: 100, y: 200 });
        assert_eq!(
            *ops.borrow(),
            vec![SinkOp::Rel(3, -1), SinkOp::Abs(100, 200)]
        );
    }

    #[test]
    fn scroll_clears_oneshot_and_reaches_the_sink() {
        let (mut dispatcher, ops, _dir) = dispatcher(&[(
            "kb.conf",
            r#"
            devices "*"
            bind "rightalt" "oneshot(sym)"
            "#,
        )]);

        dispatcher.add_device(keyboard_device(0x1111, 0x0001));

        let (listener, mut client) = UnixStream::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        dispatcher.listeners.add(listener);

        dispatcher.handle_device_event(0, DeviceEvent::Key { code: 100, pressed: true });
        dispatcher.handle_device_event(0, DeviceEvent::Key { code: 100, pressed: false });
        dispatcher.handle_device_event(0, DeviceEvent::Scroll { dx: 0, dy: -1 });

        // The oneshot was consumed by the synthetic button, nothing was
        // emitted for it, and the scroll went through exactly once.
        assert_eq!(*ops.borrow(), vec![SinkOp::Scroll(0, -1)]);

        let mut buf = [0u8; 32];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"+sym\n-sym\n");
    }

    #[test]
    fn timer_ticks_route_to_the_last_active_interpreter() {
        let (mut dispatcher, _, _dir) = dispatcher(&[
            (
                "a.conf",
                r#"
                devices "1111:0001"
                bind "space" "overload(nav, space, 1)"
                "#,
            ),
            ("b.conf", r#"devices "2222:0002""#),
        ]);

        dispatcher.add_device(keyboard_device(0x1111, 0x0001));
        dispatcher.add_device(keyboard_device(0x2222, 0x0002));

        let (listener, mut client) = UnixStream::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        dispatcher.listeners.add(listener);

        // Key event from device 0 makes its interpreter the timing one.
        let timeout = dispatcher.handle_device_event(0, DeviceEvent::Key { code: 57, pressed: true });
        assert!(timeout > 0);

        thread::sleep(Duration::from_millis(5));
        assert_eq!(dispatcher.tick(), 0);

        // The overload resolved as a hold inside interpreter A.
        let mut buf = [0u8; 32];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"+nav\n");
    }

    #[test]
    fn tick_before_any_interpreter_is_a_noop() {
        let (mut dispatcher, ops, _dir) = dispatcher(&[("all.conf", r#"devices "*""#)]);
        assert_eq!(dispatcher.tick(), 0);
        assert_eq!(*ops.borrow(), vec![]);
    }

    #[test]
    fn removal_compacts_in_order() {
        let (mut dispatcher, _, _dir) = dispatcher(&[]);

        dispatcher.add_device(keyboard_device(0x1111, 0x0001));
        dispatcher.add_device(keyboard_device(0x2222, 0x0002));
        dispatcher.add_device(keyboard_device(0x3333, 0x0003));

        let middle = dispatcher.device(1).path.clone();
        assert!(dispatcher.remove_device(&middle).is_some());

        assert_eq!(dispatcher.device_count(), 2);
        assert_eq!(dispatcher.device(0).vendor, 0x1111);
        assert_eq!(dispatcher.device(1).vendor, 0x3333);
    }

    #[test]
    fn dead_listeners_are_evicted_on_broadcast() {
        let (mut dispatcher, _, _dir) = dispatcher(&[]);

        let (l1, mut c1) = UnixStream::pair().unwrap();
        let (l2, c2) = UnixStream::pair().unwrap();
        c1.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        dispatcher.listeners.add(l1);
        dispatcher.listeners.add(l2);
        assert_eq!(dispatcher.listeners().len(), 2);

        drop(c2);
        dispatcher.listeners.broadcast("nav", true);

        assert_eq!(dispatcher.listeners().len(), 1);
        let mut buf = [0u8; 16];
        let n = c1.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"+nav\n");
    }

    #[test]
    fn listener_overflow_is_reported_and_rejected() {
        let (mut dispatcher, _, _dir) = dispatcher(&[]);

        let mut clients = Vec::new();
        for _ in 0..MAX_LISTENERS {
            let (listener, client) = UnixStream::pair().unwrap();
            dispatcher.listeners.add(listener);
            clients.push(client);
        }
        assert_eq!(dispatcher.listeners().len(), MAX_LISTENERS);

        let (listener, mut client) = UnixStream::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        dispatcher.listeners.add(listener);
        assert_eq!(dispatcher.listeners().len(), MAX_LISTENERS);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"Max listeners exceeded\n");
    }

    fn roundtrip(dispatcher: &mut Dispatcher, request: Message) -> Message {
        let (server, mut client) = UnixStream::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();

        let frame = request.encode().unwrap();
        client.write_all(&frame[..]).unwrap();
        dispatcher.handle_client(server).unwrap();

        let mut reply = Box::new([0u8; FRAME_LEN]);
        client.read_exact(&mut reply[..]).unwrap();
        Message::decode(&reply).unwrap()
    }

    #[test]
    fn reload_request_succeeds_and_closes() {
        let (mut dispatcher, _, _dir) = dispatcher(&[("all.conf", r#"devices "*""#)]);

        let reply = roundtrip(&mut dispatcher, Message::new(MessageType::Reload));
        assert_eq!(reply.ty, MessageType::Success);
        assert_eq!(reply.text(), "Success");
    }

    #[test]
    fn rejected_bind_reports_the_error() {
        let (mut dispatcher, _, _dir) = dispatcher(&[("all.conf", r#"devices "*""#)]);

        let reply = roundtrip(
            &mut dispatcher,
            Message::with_text(MessageType::Bind, "nosuchkey = a"),
        );
        assert_eq!(reply.ty, MessageType::Fail);
        assert!(reply.text().contains("nosuchkey"));
    }

    #[test]
    fn accepted_bind_applies_to_interpreters() {
        let (mut dispatcher, ops, _dir) = dispatcher(&[("all.conf", r#"devices "*""#)]);
        dispatcher.add_device(keyboard_device(0x1111, 0x0001));

        let reply = roundtrip(
            &mut dispatcher,
            Message::with_text(MessageType::Bind, "capslock = esc"),
        );
        assert_eq!(reply.ty, MessageType::Success);

        dispatcher.handle_device_event(0, DeviceEvent::Key { code: 58, pressed: true });
        assert_eq!(*ops.borrow(), vec![SinkOp::Key(1, true)]);
    }

    #[test]
    fn unknown_request_type_fails() {
        let (mut dispatcher, _, _dir) = dispatcher(&[]);

        let reply = roundtrip(&mut dispatcher, Message::new(MessageType::Fail));
        assert_eq!(reply.ty, MessageType::Fail);
        assert_eq!(reply.text(), "Unknown command");
    }

    #[test]
    fn failed_reload_is_fatal() {
        let (mut dispatcher, _, dir) = dispatcher(&[("ok.conf", r#"devices "*""#)]);

        fs::write(dir.0.join("broken.conf"), "layer {").unwrap();
        assert!(dispatcher.reload().is_err());
    }
}
