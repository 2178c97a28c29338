//! Modbus RTU frame building and parsing
//!
//! Frames travel as uppercase hex text: `slave | function | payload | crc`.
//! Every multi-byte field is big-endian except the trailing CRC, which is
//! appended low byte first.

use std::fmt;

use tracing::{debug, warn};

use crate::crc::{self, CRC_LEN};
use crate::error::{FrameError, Result};

/// Function codes used by the field node
pub mod function_code {
    /// Read holding registers
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    /// Write single register
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    /// Bit set on the function code of an exception response
    pub const EXCEPTION_FLAG: u8 = 0x80;
}

/// Request header length: slave(1) + function(1) + register(2) + count/value(2)
pub const REQUEST_HEADER_LEN: usize = 6;

/// Complete request length including CRC
pub const REQUEST_FRAME_LEN: usize = REQUEST_HEADER_LEN + CRC_LEN;

/// Shortest hex text accepted by response validation
pub const MIN_RESPONSE_HEX_LEN: usize = 6;

/// Shortest data response: slave + function + byte count + CRC
const MIN_DATA_RESPONSE_LEN: usize = 3 + CRC_LEN;

/// Offset of the first register byte in a read response
const REGISTER_DATA_OFFSET: usize = 3;

/// A raw bus frame, checksum included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Wrap raw bytes (checksum included) without validation
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Decode hex text into a frame without checking the CRC
    pub fn from_hex(text: &str) -> Result<Self> {
        if text.len() % 2 != 0 {
            return Err(FrameError::invalid(format!(
                "odd hex length {}",
                text.len()
            )));
        }
        let bytes = hex::decode(text)
            .map_err(|e| FrameError::invalid(format!("malformed hex: {e}")))?;
        Ok(Self { bytes })
    }

    /// Uppercase hex text, as sent on the wire
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn slave_address(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    pub fn function_code(&self) -> Option<u8> {
        self.bytes.get(1).copied()
    }

    /// Bytes between the function code and the CRC
    pub fn payload(&self) -> &[u8] {
        if self.bytes.len() < 2 + CRC_LEN {
            return &[];
        }
        &self.bytes[2..self.bytes.len() - CRC_LEN]
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Fields of a fixed-size request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub slave_address: u8,
    pub function_code: u8,
    pub start_register: u16,
    pub count_or_value: u16,
}

/// Outcome of response validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Ok,
    InvalidResponse,
    CrcFailed,
}

impl ValidationResult {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Build an 8-byte request frame with its CRC appended low byte first.
pub fn encode_request(
    slave_address: u8,
    function_code: u8,
    start_register: u16,
    count_or_value: u16,
) -> Frame {
    let mut bytes = Vec::with_capacity(REQUEST_FRAME_LEN);
    bytes.push(slave_address);
    bytes.push(function_code);
    bytes.extend_from_slice(&start_register.to_be_bytes());
    bytes.extend_from_slice(&count_or_value.to_be_bytes());
    let crc = crc::append_checksum(&mut bytes);

    debug!(
        "Building request frame: slave={}, FC={:02X}, register={}, value={}, CRC={:04X}",
        slave_address, function_code, start_register, count_or_value, crc
    );

    Frame::from_bytes(bytes)
}

/// Parse a request frame (or a write-single echo) back into its fields.
pub fn decode_request(frame: &Frame) -> Result<Request> {
    let bytes = frame.as_bytes();
    if bytes.len() != REQUEST_FRAME_LEN {
        return Err(FrameError::invalid(format!(
            "request frame must be {} bytes, got {}",
            REQUEST_FRAME_LEN,
            bytes.len()
        )));
    }
    check_crc(bytes)?;

    Ok(Request {
        slave_address: bytes[0],
        function_code: bytes[1],
        start_register: u16::from_be_bytes([bytes[2], bytes[3]]),
        count_or_value: u16::from_be_bytes([bytes[4], bytes[5]]),
    })
}

/// Validate a hex-encoded response: encoding first, then CRC.
pub fn validate_response(response: &str) -> ValidationResult {
    match parse_response(response) {
        Ok(_) => ValidationResult::Ok,
        Err(FrameError::CrcFailed { .. }) => ValidationResult::CrcFailed,
        Err(_) => ValidationResult::InvalidResponse,
    }
}

/// Validate a hex-encoded response and return the decoded frame.
pub fn parse_response(response: &str) -> Result<Frame> {
    if response.len() < MIN_RESPONSE_HEX_LEN {
        warn!("Response too short: {} hex chars", response.len());
        return Err(FrameError::invalid("response too short"));
    }
    if response.len() % 2 != 0 {
        warn!("Invalid response length: {} hex chars", response.len());
        return Err(FrameError::invalid("invalid response length"));
    }

    let frame = Frame::from_hex(response)?;
    check_crc(frame.as_bytes())?;
    Ok(frame)
}

fn check_crc(bytes: &[u8]) -> Result<()> {
    let (expected, received) = crc::checksum_pair(bytes)
        .ok_or_else(|| FrameError::invalid("frame too short for CRC"))?;
    if expected != received {
        warn!(
            "CRC validation failed: calculated 0x{:04X}, received 0x{:04X}",
            expected, received
        );
        return Err(FrameError::CrcFailed { expected, received });
    }
    debug!("CRC validation successful");
    Ok(())
}

/// True when the function code carries the exception flag
pub fn is_exception(frame: &Frame) -> bool {
    frame
        .function_code()
        .is_some_and(|fc| fc & function_code::EXCEPTION_FLAG != 0)
}

/// Exception code (third byte), only for exception responses
pub fn exception_code(frame: &Frame) -> Option<u8> {
    if !is_exception(frame) {
        return None;
    }
    frame.as_bytes().get(2).copied()
}

/// Decode holding-register values from a hex-encoded read response.
///
/// Registers are read big-endian after the byte-count field. A response whose
/// data runs out before the CRC yields the whole registers that are present
/// instead of an error.
pub fn decode_registers(response: &str, max_count: usize) -> Result<Vec<u16>> {
    let frame = parse_response(response)?;

    if is_exception(&frame) {
        let function = frame.function_code().unwrap_or(0) & !function_code::EXCEPTION_FLAG;
        let code = exception_code(&frame).unwrap_or(0);
        warn!(
            "Modbus exception: FC={:02X}, code=0x{:02X} ({})",
            function,
            code,
            exception_description(code)
        );
        return Err(FrameError::ModbusException { function, code });
    }

    let bytes = frame.as_bytes();
    if bytes.len() < MIN_DATA_RESPONSE_LEN {
        return Err(FrameError::invalid("response too short for data"));
    }

    let byte_count = usize::from(bytes[2]);
    let register_count = byte_count / 2;
    if register_count > max_count {
        warn!(
            "Too many registers in response: {} (max {})",
            register_count, max_count
        );
        return Err(FrameError::invalid(format!(
            "too many registers in response: {register_count} > {max_count}"
        )));
    }

    let data_end = bytes.len() - CRC_LEN;
    let mut registers = Vec::with_capacity(register_count);
    for i in 0..register_count {
        let offset = REGISTER_DATA_OFFSET + i * 2;
        if offset + 2 > data_end {
            warn!(
                "Incomplete register data: declared {} registers, only {} available",
                register_count, i
            );
            break;
        }
        registers.push(u16::from_be_bytes([bytes[offset], bytes[offset + 1]]));
    }

    Ok(registers)
}

/// Expected response length in hex characters for a request
pub fn expected_response_length(function_code: u8, register_count: u16) -> Option<usize> {
    match function_code {
        // slave(1) + fc(1) + byte_count(1) + data(n*2) + crc(2)
        function_code::READ_HOLDING_REGISTERS => Some((5 + usize::from(register_count) * 2) * 2),
        // slave(1) + fc(1) + register(2) + value(2) + crc(2)
        function_code::WRITE_SINGLE_REGISTER => Some(REQUEST_FRAME_LEN * 2),
        _ => None,
    }
}

/// Get exception description
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
