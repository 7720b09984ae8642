//! Control-channel server.

use std::io;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use anyhow::Context;
use calloop::generic::Generic;
use calloop::{Interest, LoopHandle, Mode, PostAction};

use crate::daemon::State;

pub struct IpcServer {
    /// Path to the control socket; unlinked on drop.
    pub socket_path: PathBuf,
}

impl IpcServer {
    /// Binds the control socket and registers it on the event loop.
    ///
    /// Clients are accepted and handled synchronously inside the
    /// readiness callback, so requests serialize with device events.
    pub fn start(
        event_loop: &LoopHandle<'static, State>,
        socket_path: &Path,
    ) -> anyhow::Result<Self> {
        let listener = UnixListener::bind(socket_path).with_context(|| {
            format!(
                "failed to bind {} (is another instance already running?)",
                socket_path.display()
            )
        })?;
        listener
            .set_nonblocking(true)
            .context("error setting socket to non-blocking")?;

        let source = Generic::new(listener, Interest::READ, Mode::Level);
        event_loop
            .insert_source(source, |_, listener, state| {
                match listener.accept() {
                    Ok((stream, _)) => {
                        trace!("new control client connected");
                        state
                            .dispatcher
                            .handle_client(stream)
                            .map_err(io::Error::other)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => (),
                    // Failing to accept means the socket itself is gone;
                    // stop the loop.
                    Err(e) => return Err(e),
                }

                Ok(PostAction::Continue)
            })
            .unwrap();

        Ok(Self {
            socket_path: socket_path.to_owned(),
        })
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
