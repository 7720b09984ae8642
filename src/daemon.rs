//! Daemon startup and event-loop integration.
//!
//! Everything here is wiring: it turns calloop readiness into calls on
//! the [`Dispatcher`] and routes the dispatcher's timeout hints back
//! into a timer source. The daemon has exactly one thread blocking in
//! the loop below; the device watcher thread only feeds a channel.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use calloop::channel;
use calloop::generic::{FdWrapper, Generic};
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, LoopHandle, Mode, PostAction, RegistrationToken};

use crate::device::{self, Device};
use crate::dispatcher::Dispatcher;
use crate::ipc::IpcServer;
use crate::sink::VirtualSink;
use crate::utils;
use crate::watcher::{WatchEvent, Watcher};

/// Where configuration files live unless overridden on the command line.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/keywarp";

const INPUT_DIR: &str = "/dev/input";

pub struct State {
    pub event_loop: LoopHandle<'static, State>,
    pub dispatcher: Dispatcher,
    /// Registration of the single pending interpreter-wakeup timer.
    timer_token: Option<RegistrationToken>,
    // Dropping these unlinks the socket and stops the watcher thread.
    _ipc_server: IpcServer,
    _watcher: Watcher,
}

pub fn run(config_dir: PathBuf) -> anyhow::Result<()> {
    let mut event_loop: EventLoop<State> =
        EventLoop::try_new().context("error creating the event loop")?;

    let mut state = State::new(event_loop.handle(), config_dir)?;

    utils::boost_priority();

    event_loop
        .run(None, &mut state, |_| ())
        .context("error running the event loop")?;
    Ok(())
}

impl State {
    pub fn new(event_loop: LoopHandle<'static, State>, config_dir: PathBuf) -> anyhow::Result<Self> {
        let socket_path = keywarp_ipc::socket_path();
        let ipc_server = IpcServer::start(&event_loop, &socket_path)?;
        info!("listening on {}", socket_path.display());

        let sink = VirtualSink::new().context("error creating the virtual keyboard")?;
        let mut dispatcher = Dispatcher::new(Box::new(sink), config_dir);

        // Load configurations up front; a broken config at startup is
        // fatal, same as during reload.
        dispatcher.reload()?;

        let input_dir = PathBuf::from(INPUT_DIR);
        let devices = device::enumerate(&input_dir);
        let known: HashSet<PathBuf> = device::event_nodes(&input_dir).into_iter().collect();

        let (watch_tx, watch_rx) = channel::sync_channel(64);
        let watcher = Watcher::new(input_dir, known, watch_tx);

        let mut state = Self {
            event_loop,
            dispatcher,
            timer_token: None,
            _ipc_server: ipc_server,
            _watcher: watcher,
        };

        state
            .event_loop
            .insert_source(watch_rx, |event, _, state| match event {
                channel::Event::Msg(WatchEvent::Added(path)) => state.on_device_added(&path),
                channel::Event::Msg(WatchEvent::Removed(path)) => state.on_device_removed(&path),
                channel::Event::Closed => (),
            })
            .unwrap();

        for dev in devices {
            state.register_device(dev);
        }

        Ok(state)
    }

    fn on_device_added(&mut self, path: &Path) {
        match Device::open(path) {
            Ok(Some(device)) => self.register_device(device),
            Ok(None) => {}
            Err(err) => warn!("error opening {}: {err:#}", path.display()),
        }
    }

    fn on_device_removed(&mut self, path: &Path) {
        let Some(device) = self.dispatcher.remove_device(path) else {
            return;
        };

        // Deregister the fd source before the device (and its fd) drops.
        if let Some(token) = device.token {
            self.event_loop.remove(token);
        }
    }

    fn register_device(&mut self, device: Device) {
        let path = device.path.clone();
        let fd = device.raw_fd();

        if !self.dispatcher.add_device(device) {
            return;
        }

        let Some(fd) = fd else { return };

        // SAFETY: the fd stays open while the source is registered;
        // removal deregisters the source before the device is dropped.
        let source = Generic::new(unsafe { FdWrapper::new(fd) }, Interest::READ, Mode::Level);

        let event_path = path.clone();
        let token = self
            .event_loop
            .insert_source(source, move |_, _, state| {
                state.on_device_readable(&event_path);
                Ok(PostAction::Continue)
            })
            .unwrap();

        if let Some(idx) = self.dispatcher.device_index(&path) {
            self.dispatcher.device_mut(idx).token = Some(token);
        }
    }

    fn on_device_readable(&mut self, path: &Path) {
        let Some(idx) = self.dispatcher.device_index(path) else {
            return;
        };

        let events = match self.dispatcher.device_mut(idx).poll_events() {
            Ok(events) => events,
            Err(err) => {
                // Usually ENODEV, right before the watcher reports the
                // node as removed.
                debug!("error reading {}: {err}", path.display());
                return;
            }
        };

        for event in events {
            let timeout = self.dispatcher.handle_device_event(idx, event);
            self.arm_timer(timeout);
        }
    }

    /// Replaces the pending wakeup timer with the interpreter's latest
    /// hint. 0 cancels; the expiry tick may re-arm through its return
    /// value.
    fn arm_timer(&mut self, timeout_ms: u64) {
        if let Some(token) = self.timer_token.take() {
            self.event_loop.remove(token);
        }

        if timeout_ms == 0 {
            return;
        }

        let timer = Timer::from_duration(Duration::from_millis(timeout_ms));
        let token = self
            .event_loop
            .insert_source(timer, |_, _, state| {
                let next = state.dispatcher.tick();
                if next > 0 {
                    TimeoutAction::ToDuration(Duration::from_millis(next))
                } else {
                    state.timer_token = None;
                    TimeoutAction::Drop
                }
            })
            .unwrap();
        self.timer_token = Some(token);
    }
}
