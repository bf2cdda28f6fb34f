use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, warn};

use super::*;
use crate::codec::{append_crc, bytes_to_hex, crc16, crc_of_frame, hex_to_bytes, verify_crc};
use crate::master::Exchange;

/// Capacity of the RTU receive buffer. Input past this point is dropped.
pub const RTU_BUFFER_LEN: usize = 256;

/// Byte-level access to a serial line.
///
/// Implemented for the ports returned by `serialport`; anything else that
/// behaves like a half-duplex line (a virtual port, a test double) can stand
/// in for it.
pub trait SerialLink: Send {
    /// Number of received bytes waiting to be read, without blocking.
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Drop everything received but not read yet.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(SerialPort::bytes_to_read(&**self)? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut **self, buf)
    }

    fn write_all(&mut self, frame: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut **self, frame)?;
        io::Write::flush(&mut **self)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(SerialPort::clear(&**self, ClearBuffer::Input)?)
    }
}

/// Modbus RTU master over a serial line.
///
/// The end of a response is detected by silence: once bytes start arriving
/// they are drained until no new byte shows up within the quiet period. A
/// slave that pauses longer than that mid-frame gets its response cut, which
/// then fails the CRC check. This is an approximation of the 3.5 character
/// gap of the RTU framing, not a guarantee.
pub struct RtuMaster<L: SerialLink = Box<dyn SerialPort>> {
    link: Mutex<L>,
    exchange: Exchange,
    config: RtuConfig,
}

impl RtuMaster {
    /// Open `config.port_name` with the configured line settings.
    pub fn open(config: RtuConfig) -> Result<Self, ModbusError> {
        let port = serialport::new(config.port_name.as_str(), config.baud_rate)
            .parity(config.parity)
            .data_bits(config.data_bits)
            .stop_bits(config.stop_bits)
            .timeout(config.quiet_period)
            .open()
            .map_err(|err| ModbusError::Connection {
                context: "failed to open serial port",
                source: Box::new(err),
            })?;

        info!(
            port = %config.port_name,
            baud_rate = config.baud_rate,
            parity = ?config.parity,
            "serial port opened"
        );
        Ok(Self::with_link(port, config))
    }

    /// Open a port with the default 19200 8E1 settings.
    pub fn open_port(port_name: &str) -> Result<Self, ModbusError> {
        Self::open(RtuConfig::new(port_name))
    }
}

impl<L: SerialLink> RtuMaster<L> {
    pub fn with_link(link: L, config: RtuConfig) -> Self {
        RtuMaster {
            link: Mutex::new(link),
            exchange: Exchange::default(),
            config,
        }
    }

    pub fn config(&self) -> &RtuConfig {
        &self.config
    }

    fn run_exchange(&self, hex_frame: &str) -> Result<(), ModbusError> {
        let _in_flight = self.exchange.begin()?;

        let frame = hex_to_bytes(hex_frame)?;
        if frame.is_empty() {
            return Err(FrameError::Empty.into());
        }
        let request = append_crc(&frame);

        self.link
            .lock()
            .clear_input()
            .map_err(|err| link_error("failed to discard stale input", err))?;

        let timeout = self.config.response_timeout;
        let deadline = Instant::now() + timeout;
        let (done_tx, done_rx) = mpsc::channel();
        let stop_flag = AtomicBool::new(false);
        let stop = &stop_flag;

        let outcome = thread::scope(|scope| {
            // Registers the data-arrival callback for the length of the exchange.
            scope.spawn(move || {
                if let Some(result) = self.watch_link(stop) {
                    let _ = done_tx.send(result);
                }
            });

            self.exchange.record_request(request.clone());
            let written = self.link.lock().write_all(&request);
            let outcome = match written {
                Ok(()) => {
                    debug!(port = %self.config.port_name, frame = %bytes_to_hex(&request), "RTU request sent");
                    match done_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(result) => result,
                        Err(RecvTimeoutError::Timeout) => Err(ModbusError::Timeout {
                            waited: timeout,
                            source: None,
                        }),
                        Err(RecvTimeoutError::Disconnected) => Err(ModbusError::Protocol(
                            "link monitor stopped without a response".to_string(),
                        )),
                    }
                }
                Err(err) => Err(link_error("failed to write request", err)),
            };

            // Unregister the callback; the scope joins the monitor.
            stop.store(true, Ordering::Release);
            outcome
        });

        match outcome {
            Ok(response) => self.accept_response(response),
            Err(err) => {
                if err.is_timeout() {
                    warn!(port = %self.config.port_name, ?timeout, "RTU response timed out");
                }
                self.exchange.finish(None);
                Err(err)
            }
        }
    }

    fn accept_response(&self, response: Vec<u8>) -> Result<(), ModbusError> {
        if response.is_empty() {
            self.exchange.finish(None);
            return Err(ModbusError::Protocol(
                "reception finished before timeout but the response is empty".to_string(),
            ));
        }

        debug!(port = %self.config.port_name, frame = %bytes_to_hex(&response), "RTU response received");

        let crc_error = (!verify_crc(&response)).then(|| {
            let body_len = response.len().saturating_sub(2);
            ModbusError::CrcMismatch {
                expected: crc16(&response[..body_len]),
                received: crc_of_frame(&response).unwrap_or_default(),
            }
        });

        // A corrupted frame is kept so the caller can still inspect it.
        self.exchange.finish(Some(response));
        match crc_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Poll the line until input shows up, then run the data-arrival
    /// callback. Returns `None` when stopped before anything arrived.
    fn watch_link(&self, stop: &AtomicBool) -> Option<Result<Vec<u8>, ModbusError>> {
        while !stop.load(Ordering::Acquire) {
            let mut link = self.link.lock();
            match link.bytes_to_read() {
                Ok(0) => {}
                Ok(_) => return Some(self.on_data_received(&mut *link, stop)),
                Err(err) => return Some(Err(link_error("failed to poll serial input", err))),
            }
            drop(link);
            thread::sleep(self.config.poll_interval);
        }
        None
    }

    /// Drain the line burst by burst until it stays quiet for one quiet period.
    fn on_data_received(&self, link: &mut L, stop: &AtomicBool) -> Result<Vec<u8>, ModbusError> {
        let mut buffer = Vec::with_capacity(RTU_BUFFER_LEN);
        let mut scratch = [0u8; RTU_BUFFER_LEN];
        let mut dropped = 0usize;

        loop {
            let pending = link
                .bytes_to_read()
                .map_err(|err| link_error("failed to poll serial input", err))?;
            if pending == 0 {
                break;
            }

            let wanted = pending.min(scratch.len());
            let read = link
                .read(&mut scratch[..wanted])
                .map_err(|err| link_error("failed to read response", err))?;
            let kept = read.min(RTU_BUFFER_LEN - buffer.len());
            buffer.extend_from_slice(&scratch[..kept]);
            dropped += read - kept;

            thread::sleep(self.config.quiet_period);
            if stop.load(Ordering::Acquire) {
                break;
            }
        }

        if dropped > 0 {
            warn!(port = %self.config.port_name, dropped, "RTU response exceeded {RTU_BUFFER_LEN} bytes, truncated");
        }
        Ok(buffer)
    }
}

impl<L: SerialLink> ModbusMaster for RtuMaster<L> {
    fn send_request(&self, hex_frame: &str) -> Result<(), ModbusError> {
        self.run_exchange(hex_frame)
    }

    fn is_complete(&self) -> bool {
        self.exchange.is_complete()
    }

    fn read_response(&self) -> Option<String> {
        self.exchange.response_hex()
    }

    fn read_request(&self) -> Option<String> {
        self.exchange.request_hex()
    }
}

fn link_error(context: &'static str, err: io::Error) -> ModbusError {
    ModbusError::Connection {
        context,
        source: Box::new(err),
    }
}
