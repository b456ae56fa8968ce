// src/error.rs

use thiserror::Error;

/// The primary error type for the `fs5000` library.
#[derive(Error, Debug)]
pub enum Error {
    #[error("FS5000 not found. Is the meter plugged in? (looking for USB {vid:04x}:{pid:04x})")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Checksum mismatch: computed {computed:#04x}, packet carries {received:#04x}")]
    Checksum { computed: u8, received: u8 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid argument: {0}")]
    Validation(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Sample stream closed")]
    StreamClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Framing and checksum faults are the only ones worth retrying, and only
    /// while waiting for the stop confirmation.
    pub fn is_line_noise(&self) -> bool {
        matches!(self, Error::Framing(_) | Error::Checksum { .. })
    }
}

/// A convenience `Result` alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
