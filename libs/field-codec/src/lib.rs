//! Field Codec - Modbus RTU frames over hex text
//!
//! Builds outgoing request frames and validates/decodes incoming responses
//! for the serial field bus:
//! - CRC-16/MODBUS checksum (table-driven)
//! - 8-byte request encoding (read holding registers, write single register)
//! - Response validation (encoding, CRC), exception detection
//! - Register extraction with tolerance for truncated payloads
//!
//! ```text
//! ┌───────┬──────────┬──────────────────────┬──────────┐
//! │ slave │ function │ payload (big-endian) │ CRC (LE) │
//! └───────┴──────────┴──────────────────────┴──────────┘
//! ```

pub mod crc;
mod error;
mod frame;
mod registers;

pub use crc::{append_checksum, checksum, CRC_LEN};
pub use error::{FrameError, Result};
pub use frame::{
    decode_registers, decode_request, encode_request, exception_code, exception_description,
    expected_response_length, function_code, is_exception, parse_response, validate_response,
    Frame, Request, ValidationResult, MIN_RESPONSE_HEX_LEN, REQUEST_FRAME_LEN, REQUEST_HEADER_LEN,
};
pub use registers::RegisterLimits;
