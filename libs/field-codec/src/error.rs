//! Frame codec error types

use thiserror::Error;

use crate::frame::exception_description;

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, FrameError>;

/// Errors raised while building or parsing bus frames
///
/// All of these are expected transient bus noise: the caller skips the
/// current cycle's result and carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Malformed encoding, truncated frame or out-of-bounds payload
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Checksum mismatch
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{received:04X}")]
    CrcFailed { expected: u16, received: u16 },

    /// Slave answered with an exception frame
    #[error(
        "Modbus exception: function 0x{function:02X}, code 0x{code:02X} ({})",
        exception_description(*code)
    )]
    ModbusException { function: u8, code: u8 },
}

impl FrameError {
    /// Stable error code for logs and event records
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
            Self::CrcFailed { .. } => "CRC_FAILED",
            Self::ModbusException { .. } => "MODBUS_EXCEPTION",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }
}
