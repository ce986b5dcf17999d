//! Error types for framing and peer links

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while building, encoding or decoding frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("field {field:?} contains reserved byte 0x{byte:02x}")]
    InvalidField { field: String, byte: u8 },

    #[error("message type tag is empty")]
    EmptyTag,

    #[error("corrupt frame: {0}")]
    Corrupt(String),

    #[error("frame exceeds {max} bytes without terminator")]
    TooLarge { max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Corruption means the stream can no longer be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(self, FrameError::Corrupt(_) | FrameError::TooLarge { .. })
    }
}

/// Errors on a peer link
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("could not connect to {addr} after {attempts} attempts: {source}")]
    ConnectExhausted {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("connection to {0} closed")]
    Closed(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
