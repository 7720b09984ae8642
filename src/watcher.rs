//! Input-device hot-plug watcher.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use calloop::channel::SyncSender;

use crate::device::event_nodes;

/// A device node appeared or disappeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PathBuf),
    Removed(PathBuf),
}

pub struct Watcher {
    should_stop: Arc<AtomicBool>,
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }
}

impl Watcher {
    /// Starts watching a device directory for added and removed nodes.
    ///
    /// `known` is the set of nodes the caller has already opened, so
    /// startup enumeration is not reported a second time. There is no
    /// fd-based notification for device arrival that works across
    /// containers and udev setups, so this polls, the same way the
    /// daemon would watch a config file for modification.
    pub fn new(dir: PathBuf, known: HashSet<PathBuf>, changed: SyncSender<WatchEvent>) -> Self {
        let should_stop = Arc::new(AtomicBool::new(false));

        {
            let should_stop = should_stop.clone();
            thread::Builder::new()
                .name(format!("Device watcher for {}", dir.to_string_lossy()))
                .spawn(move || {
                    let mut known = known;

                    loop {
                        thread::sleep(Duration::from_millis(500));

                        if should_stop.load(Ordering::SeqCst) {
                            break;
                        }

                        let current: HashSet<PathBuf> = event_nodes(&dir).into_iter().collect();

                        for path in current.difference(&known) {
                            trace!("device node added: {}", path.to_string_lossy());
                            if changed.send(WatchEvent::Added(path.clone())).is_err() {
                                return;
                            }
                        }
                        for path in known.difference(&current) {
                            trace!("device node removed: {}", path.to_string_lossy());
                            if changed.send(WatchEvent::Removed(path.clone())).is_err() {
                                return;
                            }
                        }

                        known = current;
                    }

                    debug!("exiting device watcher thread for {}", dir.to_string_lossy());
                })
                .unwrap();
        }

        Self { should_stop }
    }
}
