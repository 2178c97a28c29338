//! CRC-16/MODBUS checksum
//!
//! Reflected polynomial 0xA001 with initial value 0xFFFF. The lookup table is
//! generated at compile time from the bitwise RTU algorithm, so both forms
//! always agree.

/// Reflected generator polynomial (0x8005 bit-reversed)
const POLY: u16 = 0xA001;

/// Initial register value
const INIT: u16 = 0xFFFF;

/// Number of trailing checksum bytes in an RTU frame
pub const CRC_LEN: usize = 2;

static TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Calculate the CRC16 checksum (Modbus RTU standard) over `data`.
///
/// Callers pass every byte except any trailing checksum bytes.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(INIT, |crc, &byte| {
        (crc >> 8) ^ TABLE[usize::from((crc ^ u16::from(byte)) & 0x00FF)]
    })
}

/// Append the checksum of `frame` to it, low byte first.
///
/// Returns the appended checksum value.
pub fn append_checksum(frame: &mut Vec<u8>) -> u16 {
    let crc = checksum(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    crc
}

/// Split a frame into `(computed, received)` checksums.
///
/// Returns `None` when the frame cannot hold a checksum.
pub fn checksum_pair(frame: &[u8]) -> Option<(u16, u16)> {
    if frame.len() < CRC_LEN {
        return None;
    }
    let body_len = frame.len() - CRC_LEN;
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    Some((checksum(&frame[..body_len]), received))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_read_request() {
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        // Appears on the wire as 84 0A
        assert_eq!(checksum(&data), 0x0A84);
    }

    #[test]
    fn test_crc16_check_string() {
        assert_eq!(checksum(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_empty_data() {
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn test_table_matches_reference_crate() {
        let reference = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);
        let samples: [&[u8]; 4] = [
            &[0x11, 0x03, 0x00, 0x00, 0x00, 0x0A],
            &[0x11, 0x06, 0x00, 0x08, 0x00, 0x32],
            &[0xFF; 32],
            &[0x00, 0x80, 0x7F, 0x01],
        ];
        for data in samples {
            assert_eq!(checksum(data), reference.checksum(data));
        }
    }

    #[test]
    fn test_append_checksum_low_byte_first() {
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let crc = append_checksum(&mut frame);
        assert_eq!(crc, 0x0A84);
        assert_eq!(&frame[6..], &[0x84, 0x0A]);
    }

    #[test]
    fn test_checksum_pair() {
        let mut frame = vec![0x11, 0x03, 0x00, 0x00, 0x00, 0x0A];
        append_checksum(&mut frame);
        let (computed, received) = checksum_pair(&frame).unwrap();
        assert_eq!(computed, received);

        assert!(checksum_pair(&[0x01]).is_none());
    }

    #[test]
    fn test_checksum_is_idempotent() {
        let data = [0x11, 0x03, 0x06, 0x01, 0x02, 0x03, 0x04, 0x05];
        assert_eq!(checksum(&data), checksum(&data));
    }
}
