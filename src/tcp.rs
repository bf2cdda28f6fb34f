use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::*;
use crate::codec::{MBAP_HEADER_LEN, build_mbap_frame, bytes_to_hex, hex_to_bytes};
use crate::master::Exchange;

/// Largest value of the MBAP length field: unit id + 253 byte PDU.
const MAX_MBAP_LENGTH: usize = 254;

/// Modbus TCP master over one client connection.
///
/// Responses are delimited by the MBAP length field; nothing is checksummed.
pub struct TcpMaster {
    stream: TcpStream,
    peer: SocketAddr,
    exchange: Exchange,
    counter: Arc<TransactionCounter>,
    config: TcpConfig,
}

impl TcpMaster {
    /// Connect to `host:port` with default timings.
    pub fn open(host: &str, port: u16) -> Result<Self, ModbusError> {
        Self::connect(TcpConfig::builder(host).port(port).build())
    }

    /// Connect using the process-wide transaction counter.
    pub fn connect(config: TcpConfig) -> Result<Self, ModbusError> {
        Self::connect_with_counter(config, TransactionCounter::shared())
    }

    pub fn connect_with_counter(
        config: TcpConfig,
        counter: Arc<TransactionCounter>,
    ) -> Result<Self, ModbusError> {
        let addrs = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|err| ModbusError::Connection {
                context: "failed to resolve server address",
                source: Box::new(err),
            })?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => return Self::with_stream(stream, config, counter),
                Err(err) => {
                    debug!(%addr, error = %err, "connection attempt failed");
                    last_err = Some(err);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "server address resolved to nothing")
        });
        Err(ModbusError::from_io(
            "failed to connect to server",
            config.connect_timeout,
            err,
        ))
    }

    /// Wrap an already connected stream.
    pub fn with_stream(
        stream: TcpStream,
        config: TcpConfig,
        counter: Arc<TransactionCounter>,
    ) -> Result<Self, ModbusError> {
        let setup = |err: io::Error| ModbusError::Connection {
            context: "failed to configure socket",
            source: Box::new(err),
        };
        stream
            .set_read_timeout(Some(config.response_timeout))
            .map_err(setup)?;
        stream.set_nodelay(true).map_err(setup)?;
        let peer = stream.peer_addr().map_err(setup)?;

        info!(%peer, "connected to Modbus TCP server");
        Ok(TcpMaster {
            stream,
            peer,
            exchange: Exchange::default(),
            counter,
            config,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn transaction_counter(&self) -> &Arc<TransactionCounter> {
        &self.counter
    }

    fn run_exchange(&self, hex_frame: &str) -> Result<(), ModbusError> {
        let _in_flight = self.exchange.begin()?;

        let frame = hex_to_bytes(hex_frame)?;
        let (&unit_id, pdu) = frame.split_first().ok_or(FrameError::Empty)?;
        let request = build_mbap_frame(&self.counter, unit_id, pdu)?;
        let transaction_id = u16::from_be_bytes([request[0], request[1]]);

        let timeout = self.config.response_timeout;
        self.discard_stale_input()?;
        let deadline = Instant::now() + timeout;

        let outcome = thread::scope(|scope| {
            // The read is what completes the exchange, so it starts first.
            let reader = scope.spawn(|| self.receive_response(transaction_id, deadline));

            self.exchange.record_request(request.clone());
            if let Err(err) = (&self.stream).write_all(&request) {
                // Unblock the reader; the connection is unusable anyway.
                let _ = self.stream.shutdown(Shutdown::Both);
                let _ = reader.join();
                return Err(ModbusError::from_io("failed to write request", timeout, err));
            }
            debug!(peer = %self.peer, frame = %bytes_to_hex(&request), "TCP request sent");

            match reader.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        });

        if let Err(err) = &outcome {
            if err.is_timeout() {
                warn!(peer = %self.peer, ?timeout, transaction_id, "TCP response timed out");
            }
            self.exchange.finish(None);
        }
        outcome
    }

    /// Read MBAP frames until the one answering `transaction_id` arrives and
    /// publish it as the exchange result. Late answers to earlier requests
    /// are read whole and dropped.
    fn receive_response(&self, transaction_id: u16, deadline: Instant) -> Result<(), ModbusError> {
        loop {
            let response = self.read_frame(deadline)?;
            let received = u16::from_be_bytes([response[0], response[1]]);
            if received == transaction_id {
                debug!(peer = %self.peer, frame = %bytes_to_hex(&response), "TCP response received");
                self.exchange.finish(Some(response));
                return Ok(());
            }

            warn!(
                expected = transaction_id,
                received,
                frame = %bytes_to_hex(&response),
                "discarding response to an earlier request"
            );
        }
    }

    /// Read one complete MBAP frame: the 7 header bytes, then `length - 1`.
    fn read_frame(&self, deadline: Instant) -> Result<Vec<u8>, ModbusError> {
        let mut header = [0u8; MBAP_HEADER_LEN];
        self.fill(&mut header, deadline)?;

        let mbap = MbapHeader::decode(&header);
        if mbap.protocol_id != 0 {
            return Err(ModbusError::Protocol(format!(
                "invalid protocol id {:#06x} in response",
                mbap.protocol_id
            )));
        }
        if mbap.length == 0 || mbap.length as usize > MAX_MBAP_LENGTH {
            return Err(ModbusError::Protocol(format!(
                "invalid MBAP length {} in response",
                mbap.length
            )));
        }

        let mut frame = vec![0u8; MBAP_HEADER_LEN + mbap.remaining()];
        frame[..MBAP_HEADER_LEN].copy_from_slice(&header);
        self.fill(&mut frame[MBAP_HEADER_LEN..], deadline)?;
        Ok(frame)
    }

    /// Drop whatever is already buffered on the socket, without blocking.
    fn discard_stale_input(&self) -> Result<(), ModbusError> {
        let timeout = self.config.response_timeout;
        let nonblocking = |on: bool| {
            self.stream
                .set_nonblocking(on)
                .map_err(|err| ModbusError::from_io("failed to switch socket mode", timeout, err))
        };

        nonblocking(true)?;
        let mut scratch = [0u8; 256];
        let mut discarded = 0usize;
        let drained = loop {
            match (&self.stream).read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(read) => discarded += read,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Err(ModbusError::from_io("failed to discard stale input", timeout, err)),
            }
        };
        nonblocking(false)?;

        if discarded > 0 {
            warn!(peer = %self.peer, discarded, "discarded stale bytes before request");
        }
        drained
    }

    /// Read until `buf` is full. A read returning nothing means the rest of
    /// the frame has not arrived yet and is retried after a pause.
    fn fill(&self, buf: &mut [u8], deadline: Instant) -> Result<(), ModbusError> {
        let timeout = self.config.response_timeout;
        let mut offset = 0;

        while offset < buf.len() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(ModbusError::Timeout {
                    waited: timeout,
                    source: None,
                });
            }
            self.stream
                .set_read_timeout(Some(left.max(Duration::from_millis(1))))
                .map_err(|err| ModbusError::from_io("failed to arm read timeout", timeout, err))?;

            match (&self.stream).read(&mut buf[offset..]) {
                Ok(0) => {
                    trace!(peer = %self.peer, offset, "empty read, waiting for the rest of the frame");
                    thread::sleep(self.config.read_retry_pause.min(left));
                }
                Ok(read) => offset += read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(ModbusError::from_io("failed to read response", timeout, err)),
            }
        }
        Ok(())
    }
}

impl ModbusMaster for TcpMaster {
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

impl Drop for TcpMaster {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
