//! Wire frame types and constants.
//!
//! Every frame is a fixed 8-byte big-endian header `[length: u32][type: u32]`
//! followed by exactly `length` payload bytes. There is no in-band framing
//! escape; a malformed frame closes the session.

use crate::error::WireError;

/// Frame header size: 4 bytes length + 4 bytes type, big-endian.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum frame payload size: 16 MiB.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    Auth = 0,
    Query = 1,
    Result = 2,
    Error = 3,
}

impl MessageKind {
    pub fn from_u32(v: u32) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::Auth),
            1 => Ok(Self::Query),
            2 => Ok(Self::Result),
            3 => Ok(Self::Error),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn auth(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Auth, payload)
    }

    pub fn query(sql: &str) -> Self {
        Self::new(MessageKind::Query, sql.as_bytes().to_vec())
    }

    pub fn result(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Result, payload)
    }

    pub fn error(message: &str) -> Self {
        Self::new(MessageKind::Error, message.as_bytes().to_vec())
    }

    /// Payload as UTF-8, lossy.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
