//! Error types for loaderboot.

use std::io;
use thiserror::Error;

/// Result type for loaderboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for loaderboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the serial channel.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Byte read exceeded its timeout budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The line was silent: no frame even started. Not answered with a
    /// failure acknowledgement, the loop just keeps listening.
    #[error("Line idle, no frame started")]
    Idle,

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC computed over the received bytes.
        expected: u16,
        /// CRC carried by the sender.
        actual: u16,
    },

    /// Malformed command frame (header scan exhausted, bad pad byte,
    /// oversized packet).
    #[error("Frame error: {0}")]
    Frame(String),

    /// Command carried invalid parameters (length/address/bounds).
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// Command opcode with no registered handler.
    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// YMODEM transfer error.
    #[error("YMODEM error: {0}")]
    Ymodem(String),

    /// YMODEM block arrived out of sequence.
    #[error("YMODEM sequence error: expected block {expected}, got {actual}")]
    Sequence {
        /// Block number the session was waiting for.
        expected: u8,
        /// Block number actually received.
        actual: u8,
    },

    /// Transfer cancelled by the peer (repeated CAN bytes).
    #[error("Transfer cancelled by peer")]
    Cancelled,

    /// Flash driver reported an erase/write/read failure.
    #[error("Flash error: {0}")]
    Flash(String),

    /// Efuse configuration blob failed verification.
    #[cfg(feature = "efuse")]
    #[error("Efuse error: {0}")]
    Efuse(String),
}

impl Error {
    /// Whether this error is a per-byte read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
