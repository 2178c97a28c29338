//! Serial field bus transport
//!
//! Frames leave as bytes and responses come back as hex text, matching the
//! gateway the node talks to. [`SimulatedInverter`] stands in for the RS-485
//! link and the inverter behind it.

use errors::{NodeError, NodeResult};
use field_codec::{
    append_checksum, decode_request, function_code, Frame, FrameError, Request, REQUEST_FRAME_LEN,
};
use tracing::{debug, trace, warn};

/// Request/response exchange with the field bus
pub trait BusTransport {
    /// Send one request frame and return the raw hex response
    fn transact(&mut self, request: &Frame) -> NodeResult<String>;

    /// Check that the link is up
    fn probe(&mut self) -> NodeResult<()> {
        Ok(())
    }
}

pub const ILLEGAL_FUNCTION: u8 = 0x01;
pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// In-process Modbus slave with a holding-register bank
#[derive(Debug, Clone)]
pub struct SimulatedInverter {
    slave_address: u8,
    registers: Vec<u16>,
    online: bool,
    corrupt_next: bool,
    transactions: u64,
}

impl SimulatedInverter {
    pub fn new(slave_address: u8, register_count: u16) -> Self {
        Self {
            slave_address,
            registers: vec![0; usize::from(register_count)],
            online: true,
            corrupt_next: false,
            transactions: 0,
        }
    }

    /// Bank preloaded with plausible inverter readings
    pub fn with_sample_readings(slave_address: u8, register_count: u16) -> Self {
        let mut inverter = Self::new(slave_address, register_count);
        // Vac, Iac, Fac, Vpv1, Vpv2, Ipv1, Ipv2, temperature, export %, Pac
        let readings = [2308, 52, 5001, 3620, 3580, 41, 39, 412, 100, 1195];
        for (slot, value) in inverter.registers.iter_mut().zip(readings) {
            *slot = value;
        }
        inverter
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.registers.get(usize::from(address)).copied()
    }

    pub fn set_register(&mut self, address: u16, value: u16) -> bool {
        match self.registers.get_mut(usize::from(address)) {
            Some(slot) => {
                *slot = value;
                true
            },
            None => false,
        }
    }

    /// Flip a bit in the CRC of the next response
    pub fn corrupt_next_response(&mut self) {
        self.corrupt_next = true;
    }

    /// Offline inverters never answer
    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    fn respond(&mut self, request: &Request) -> Vec<u8> {
        match request.function_code {
            function_code::READ_HOLDING_REGISTERS => self.read_holding(request),
            function_code::WRITE_SINGLE_REGISTER => self.write_single(request),
            other => {
                debug!("Simulated inverter: unsupported FC {:02X}", other);
                exception(request, ILLEGAL_FUNCTION)
            },
        }
    }

    fn read_holding(&self, request: &Request) -> Vec<u8> {
        let start = usize::from(request.start_register);
        let count = usize::from(request.count_or_value);
        let Some(values) = self.registers.get(start..start + count).filter(|v| !v.is_empty())
        else {
            return exception(request, ILLEGAL_DATA_ADDRESS);
        };

        let mut bytes = Vec::with_capacity(5 + count * 2);
        bytes.push(request.slave_address);
        bytes.push(request.function_code);
        bytes.push((count * 2) as u8);
        for value in values {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        append_checksum(&mut bytes);
        bytes
    }

    fn write_single(&mut self, request: &Request) -> Vec<u8> {
        if !self.set_register(request.start_register, request.count_or_value) {
            return exception(request, ILLEGAL_DATA_ADDRESS);
        }
        // Echo of the request
        let mut bytes = Vec::with_capacity(REQUEST_FRAME_LEN);
        bytes.push(request.slave_address);
        bytes.push(request.function_code);
        bytes.extend_from_slice(&request.start_register.to_be_bytes());
        bytes.extend_from_slice(&request.count_or_value.to_be_bytes());
        append_checksum(&mut bytes);
        bytes
    }
}

fn exception(request: &Request, code: u8) -> Vec<u8> {
    let mut bytes = vec![
        request.slave_address,
        request.function_code | function_code::EXCEPTION_FLAG,
        code,
    ];
    append_checksum(&mut bytes);
    bytes
}

impl BusTransport for SimulatedInverter {
    fn transact(&mut self, request: &Frame) -> NodeResult<String> {
        self.transactions += 1;
        if !self.online {
            return Err(NodeError::Timeout(format!("slave {}", self.slave_address)));
        }

        let decoded = match decode_request(request) {
            Ok(decoded) => decoded,
            // A slave drops frames it cannot read
            Err(FrameError::CrcFailed { .. }) | Err(FrameError::InvalidResponse(_)) => {
                warn!("Simulated inverter dropped malformed request {}", request);
                return Err(NodeError::Timeout(format!("slave {}", self.slave_address)));
            },
            Err(e) => return Err(e.into()),
        };
        if decoded.slave_address != self.slave_address {
            return Err(NodeError::Timeout(format!("slave {}", decoded.slave_address)));
        }

        let mut response = self.respond(&decoded);
        if std::mem::take(&mut self.corrupt_next) {
            if let Some(last) = response.last_mut() {
                *last ^= 0x01;
            }
        }

        let hex = Frame::from_bytes(response).to_hex();
        trace!("Simulated inverter: {} -> {}", request, hex);
        Ok(hex)
    }

    fn probe(&mut self) -> NodeResult<()> {
        if self.online {
            Ok(())
        } else {
            Err(NodeError::Communication(format!(
                "no answer from slave {}",
                self.slave_address
            )))
        }
    }
}
