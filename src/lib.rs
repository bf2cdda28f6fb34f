// lib.rs

pub mod codec;
mod config;
mod master;
mod rtu;
mod tcp;

use std::io;
use std::time::Duration;

pub use codec::{FrameError, MbapHeader, TransactionCounter};
pub use config::{RtuConfig, RtuConfigBuilder, TcpConfig, TcpConfigBuilder};
pub use master::ModbusMaster;
pub use rtu::{RtuMaster, SerialLink};
pub use tcp::TcpMaster;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    #[error("Invalid frame")]
    Format(#[source] FrameError),

    #[error("Frame too large: PDU of {0} bytes exceeds {max}", max = codec::MAX_MBAP_PDU_LEN)]
    FrameTooLarge(usize),

    #[error("CRC mismatch: expected {expected:#06x}, received {received:#06x}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("No response within {waited:?}")]
    Timeout {
        waited: Duration,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Connection error: {context}")]
    Connection {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("An exchange is already in progress")]
    Busy,
}

impl From<FrameError> for ModbusError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge(len) => ModbusError::FrameTooLarge(len),
            other => ModbusError::Format(other),
        }
    }
}

impl ModbusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModbusError::Timeout { .. })
    }

    /// Timeouts and corrupted responses may succeed when sent again. The
    /// library never resends on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModbusError::Timeout { .. } | ModbusError::CrcMismatch { .. } | ModbusError::Busy
        )
    }

    /// Classify an I/O failure: timeouts stay distinguishable from other faults.
    pub(crate) fn from_io(context: &'static str, waited: Duration, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ModbusError::Timeout {
                waited,
                source: Some(err),
            },
            _ => ModbusError::Connection {
                context,
                source: Box::new(err),
            },
        }
    }
}
