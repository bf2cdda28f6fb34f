use std::fmt::Write;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// Largest PDU (function code + data) an MBAP frame may carry.
pub const MAX_MBAP_PDU_LEN: usize = 252;

/// MBAP header plus the unit identifier.
pub const MBAP_HEADER_LEN: usize = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Odd number of hexadecimal digits: {0}")]
    OddLength(usize),

    #[error("Invalid hexadecimal pair {pair:?} at byte {index}")]
    InvalidDigit { index: usize, pair: String },

    #[error("Empty frame")]
    Empty,

    #[error("PDU length {0} > {max}", max = MAX_MBAP_PDU_LEN)]
    TooLarge(usize),
}

/// Split a word into `[low, high]`. CRC words travel in this order.
pub fn word16_to_bytes(value: u16) -> [u8; 2] {
    [value as u8, (value >> 8) as u8]
}

pub fn bytes_to_word16(bytes: [u8; 2]) -> u16 {
    bytes[0] as u16 + 256 * bytes[1] as u16
}

/// Decode a hex string, each pair of digits giving one byte, high nibble first.
/// Whitespace anywhere in the text is ignored.
pub fn hex_to_bytes(text: &str) -> Result<Vec<u8>, FrameError> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(FrameError::OddLength(digits.len()));
    }

    let mut bytes = Vec::with_capacity(digits.len() / 2);
    for (index, pair) in digits.chunks(2).enumerate() {
        match (pair[0].to_digit(16), pair[1].to_digit(16)) {
            (Some(high), Some(low)) => bytes.push((high << 4 | low) as u8),
            _ => {
                return Err(FrameError::InvalidDigit {
                    index,
                    pair: pair.iter().collect(),
                });
            }
        }
    }
    Ok(bytes)
}

/// Render bytes as lowercase hex, every byte followed by a space: `"01 03 "`.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() * 3);
    for byte in bytes {
        // Writing into a String cannot fail
        let _ = write!(text, "{byte:02x} ");
    }
    text
}

/// Modbus CRC-16: reflected polynomial 0xA001, initial register 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

pub fn append_crc(frame: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(frame.len() + 2);
    framed.extend_from_slice(frame);
    framed.extend_from_slice(&word16_to_bytes(crc16(frame)));
    framed
}

/// CRC word carried in the last two bytes of an RTU frame.
pub fn crc_of_frame(framed: &[u8]) -> Option<u16> {
    let tail = framed.len().checked_sub(2)?;
    Some(bytes_to_word16([framed[tail], framed[tail + 1]]))
}

pub fn verify_crc(framed: &[u8]) -> bool {
    match crc_of_frame(framed) {
        Some(received) => received == crc16(&framed[..framed.len() - 2]),
        None => false,
    }
}

/// Source of MBAP transaction identifiers.
///
/// Starts at 0 and wraps after 65535. [`TransactionCounter::shared`] hands
/// out the one counter used by every TCP session of the process; tests and
/// callers that want their own sequence create one with
/// [`TransactionCounter::new`].
#[derive(Debug, Default)]
pub struct TransactionCounter {
    next: AtomicU16,
}

impl TransactionCounter {
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    pub const fn starting_at(value: u16) -> Self {
        TransactionCounter {
            next: AtomicU16::new(value),
        }
    }

    pub fn shared() -> Arc<TransactionCounter> {
        static PROCESS_COUNTER: OnceLock<Arc<TransactionCounter>> = OnceLock::new();
        PROCESS_COUNTER
            .get_or_init(|| Arc::new(TransactionCounter::new()))
            .clone()
    }

    /// Value the next frame will carry.
    pub fn peek(&self) -> u16 {
        self.next.load(Ordering::SeqCst)
    }

    /// Return the current value and advance (wrapping).
    pub fn advance(&self) -> u16 {
        // fetch_add on atomics wraps on overflow
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Wrap a PDU in an MBAP header addressed to `unit_id`.
pub fn build_mbap_frame(
    counter: &TransactionCounter,
    unit_id: u8,
    pdu: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if pdu.len() > MAX_MBAP_PDU_LEN {
        return Err(FrameError::TooLarge(pdu.len()));
    }

    let transaction_id = counter.advance();
    let length = (pdu.len() + 1) as u16;

    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn decode(bytes: &[u8; MBAP_HEADER_LEN]) -> Self {
        MbapHeader {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        }
    }

    /// PDU bytes following the unit identifier.
    pub fn remaining(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_pairing_is_little_endian() {
        assert_eq!(word16_to_bytes(0x0A84), [0x84, 0x0A]);
        assert_eq!(bytes_to_word16([0x84, 0x0A]), 0x0A84);
    }

    #[test]
    fn hex_ignores_tabs_and_newlines() {
        assert_eq!(hex_to_bytes("01\t03\n0a").unwrap(), vec![0x01, 0x03, 0x0A]);
    }

    #[test]
    fn hex_rejects_sign_prefix() {
        assert!(matches!(
            hex_to_bytes("+1"),
            Err(FrameError::InvalidDigit { index: 0, .. })
        ));
    }

    #[test]
    fn crc_of_short_frame_is_absent() {
        assert_eq!(crc_of_frame(&[0x01]), None);
        assert!(!verify_crc(&[0x01]));
        assert!(!verify_crc(&[]));
    }

    #[test]
    fn counter_wraps() {
        let counter = TransactionCounter::starting_at(u16::MAX);
        assert_eq!(counter.advance(), u16::MAX);
        assert_eq!(counter.advance(), 0);
    }

    #[test]
    fn header_remaining_never_underflows() {
        let header = MbapHeader::decode(&[0, 1, 0, 0, 0, 0, 1]);
        assert_eq!(header.remaining(), 0);
    }
}
