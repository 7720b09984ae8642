//! Helper for blocking communication over the keywarp control socket.

use std::env;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use directories::BaseDirs;

use crate::{Message, MessageType, FRAME_LEN};

/// Name of the environment variable overriding the control socket path.
pub const SOCKET_PATH_ENV: &str = "KEYWARP_SOCKET";

/// Returns the path the daemon binds its control socket to.
///
/// [`SOCKET_PATH_ENV`] takes priority; otherwise the socket lives in the
/// user's runtime directory, falling back to the temporary directory.
pub fn socket_path() -> PathBuf {
    if let Some(path) = env::var_os(SOCKET_PATH_ENV) {
        return PathBuf::from(path);
    }

    let mut dir = BaseDirs::new()
        .as_ref()
        .and_then(|x| x.runtime_dir())
        .map(|x| x.to_owned())
        .unwrap_or_else(env::temp_dir);
    dir.push("keywarp.sock");
    dir
}

/// Helper for blocking communication over the keywarp control socket.
///
/// Handles the socket connection and the fixed-size envelope framing. The
/// daemon closes the connection after a single request/reply exchange, so
/// one `Socket` serves one request.
pub struct Socket {
    stream: UnixStream,
}

impl Socket {
    /// Connects to the default control socket.
    pub fn connect() -> io::Result<Self> {
        Self::connect_to(socket_path())
    }

    /// Connects to the control socket at the given path.
    pub fn connect_to(path: impl AsRef<Path>) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        Ok(Self { stream })
    }

    /// Sends one request and reads the single reply envelope.
    pub fn send_request(mut self, request: Message) -> io::Result<Message> {
        let frame = request
            .encode()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.stream.write_all(&frame[..])?;

        let mut reply = Box::new([0u8; FRAME_LEN]);
        self.stream.read_exact(&mut reply[..])?;
        Message::decode(&reply).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Subscribes to layer-state notifications.
    ///
    /// Sends a [`MessageType::LayerListen`] request and converts the
    /// connection into a [`LayerStream`] yielding one record per layer
    /// transition.
    pub fn subscribe_layers(mut self) -> io::Result<LayerStream> {
        let frame = Message::new(MessageType::LayerListen)
            .encode()
            .expect("empty payload always encodes");
        self.stream.write_all(&frame[..])?;

        Ok(LayerStream {
            lines: BufReader::new(self.stream),
        })
    }
}

/// Stream of layer-state change records.
pub struct LayerStream {
    lines: BufReader<UnixStream>,
}

impl Iterator for LayerStream {
    /// Layer name and whether it was activated.
    type Item = io::Result<(String, bool)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.lines.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err)),
            }

            let record = line.trim_end_matches('\n');
            match record.as_bytes().first() {
                Some(b'+') => return Some(Ok((record[1..].to_owned(), true))),
                Some(b'-') => return Some(Ok((record[1..].to_owned(), false))),
                // Unknown records are skipped so the protocol can grow.
                _ => continue,
            }
        }
    }
}
