//! Error types for the wire codec.

use thiserror::Error;

/// Errors that can occur during frame encode/decode.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Whether this error only means "need more bytes" rather than a
    /// malformed frame.
    pub fn is_truncated(&self) -> bool {
        matches!(self, WireError::Truncated { .. })
    }
}
