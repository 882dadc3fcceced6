//! Error types for CH347 operations

use thiserror::Error;

/// Which part of an I2C transaction was not acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackPhase {
    /// The target did not acknowledge its address (write direction)
    WriteAddress,
    /// The target did not acknowledge a data byte
    Data,
    /// The target did not acknowledge its address after the repeated start
    ReadAddress,
}

impl std::fmt::Display for NackPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NackPhase::WriteAddress => write!(f, "address (write)"),
            NackPhase::Data => write!(f, "data"),
            NackPhase::ReadAddress => write!(f, "address (read)"),
        }
    }
}

/// Errors that can occur when talking to a CH347
#[derive(Debug, Error)]
pub enum Ch347Error {
    /// No matching HID device
    #[error("CH347 device not found (VID:1a86 PID:55db or 55de)")]
    DeviceNotFound,

    /// Failed to open the HID device
    #[error("Failed to open CH347: {0}")]
    OpenFailed(String),

    /// HID write or read failed
    #[error("HID transfer failed: {0}")]
    Transport(String),

    /// The transport accepted fewer bytes than the report holds
    #[error("Short HID write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// No reply (or only part of one) arrived within the read timeout
    #[error("Timeout waiting for CH347 reply")]
    Timeout,

    /// Reply could not be parsed
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Reply echoed a different opcode than the command that was sent
    #[error("Malformed response: expected opcode 0x{expected:02X}, got 0x{actual:02X}")]
    OpcodeMismatch { expected: u8, actual: u8 },

    /// SPI reply carried a different number of bytes than were clocked
    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// I2C target did not acknowledge
    #[error("I2C NACK on {phase} byte {index}")]
    DeviceNack { phase: NackPhase, index: usize },

    /// Device answered with a non-zero status
    #[error("Command 0x{opcode:02X} rejected with status 0x{status:02X}")]
    Rejected { opcode: u8, status: u8 },

    /// Leftover reply bytes from an earlier command could not be drained
    #[error("Session out of sync: stale reply bytes could not be drained")]
    SessionDesynced,

    /// Bus used before a successful configure
    #[error("Bus not configured")]
    NotConfigured,

    /// Invalid argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl Ch347Error {
    /// True for errors caused by a reply that did not match its command
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Ch347Error::MalformedResponse(_) | Ch347Error::OpcodeMismatch { .. }
        )
    }
}

/// Result type for CH347 operations
pub type Result<T> = std::result::Result<T, Ch347Error>;

#[cfg(feature = "hidapi")]
impl From<hidapi::HidError> for Ch347Error {
    fn from(e: hidapi::HidError) -> Self {
        Ch347Error::Transport(e.to_string())
    }
}
