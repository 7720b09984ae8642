//! Types for communicating with keywarp via its control socket.
#![warn(missing_docs)]

use std::error::Error;
use std::fmt;

mod socket;

pub use socket::{socket_path, LayerStream, Socket, SOCKET_PATH_ENV};

/// Maximum payload size carried by one message envelope.
pub const DATA_MAX: usize = 4096;

/// Size in bytes of one complete wire frame.
///
/// Every message occupies a full frame regardless of how much of the
/// payload is used: a fixed-size header followed by [`DATA_MAX`] bytes.
pub const FRAME_LEN: usize = 8 + DATA_MAX;

/// Discriminator for a control message.
///
/// Encoded as a host-order `u32` on the wire. Clients always talk to a
/// daemon on the same machine, so no byte-order conversion takes place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Ask the daemon to re-read its configuration directory.
    Reload = 1,
    /// Apply a textual binding expression to every loaded configuration.
    Bind = 2,
    /// Subscribe to layer-state change notifications.
    ///
    /// The daemon sends no reply envelope; instead the connection switches
    /// to a stream of newline-terminated `+name` / `-name` text records.
    LayerListen = 3,
    /// Successful reply. The payload is a human-readable message.
    Success = 4,
    /// Failed reply. The payload is a human-readable error string.
    Fail = 5,
}

impl MessageType {
    fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Reload,
            2 => Self::Bind,
            3 => Self::LayerListen,
            4 => Self::Success,
            5 => Self::Fail,
            _ => return None,
        })
    }
}

/// One request or reply on the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// What kind of message this is.
    pub ty: MessageType,
    /// Payload bytes; meaning depends on [`Self::ty`].
    pub data: Vec<u8>,
}

impl Message {
    /// Creates a message with an empty payload.
    pub fn new(ty: MessageType) -> Self {
        Self { ty, data: Vec::new() }
    }

    /// Creates a message carrying a textual payload.
    pub fn with_text(ty: MessageType, text: &str) -> Self {
        Self {
            ty,
            data: text.as_bytes().to_vec(),
        }
    }

    /// Returns the payload interpreted as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Serializes the message into a full wire frame.
    ///
    /// Fails with [`ProtocolError::Oversized`] if the payload exceeds
    /// [`DATA_MAX`].
    pub fn encode(&self) -> Result<Box<[u8; FRAME_LEN]>, ProtocolError> {
        if self.data.len() > DATA_MAX {
            return Err(ProtocolError::Oversized(self.data.len()));
        }

        let mut frame = Box::new([0u8; FRAME_LEN]);
        frame[0..4].copy_from_slice(&(self.ty as u32).to_ne_bytes());
        frame[4..8].copy_from_slice(&(self.data.len() as u32).to_ne_bytes());
        frame[8..8 + self.data.len()].copy_from_slice(&self.data);
        Ok(frame)
    }

    /// Deserializes a message from a full wire frame.
    pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<Self, ProtocolError> {
        let raw_ty = u32::from_ne_bytes(frame[0..4].try_into().unwrap());
        let size = u32::from_ne_bytes(frame[4..8].try_into().unwrap()) as usize;

        let ty = MessageType::from_u32(raw_ty).ok_or(ProtocolError::UnknownType(raw_ty))?;
        if size > DATA_MAX {
            return Err(ProtocolError::Oversized(size));
        }

        Ok(Self {
            ty,
            data: frame[8..8 + size].to_vec(),
        })
    }
}

/// Error decoding or encoding a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The type discriminator does not correspond to any known message.
    UnknownType(u32),
    /// The payload length exceeds [`DATA_MAX`].
    Oversized(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(raw) => write!(f, "unknown message type {raw}"),
            Self::Oversized(size) => {
                write!(f, "payload of {size} bytes exceeds the {DATA_MAX}-byte maximum")
            }
        }
    }
}

impl Error for ProtocolError {}
