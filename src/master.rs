use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::ModbusError;
use crate::codec::bytes_to_hex;

/// Request/response capability shared by the RTU and TCP masters.
///
/// `send_request` takes a hex frame without CRC or MBAP header (slave
/// address first), transmits it and blocks until the exchange resolves.
/// Another thread holding the same master may poll `is_complete` meanwhile;
/// a second `send_request` while one is outstanding fails with
/// [`ModbusError::Busy`].
pub trait ModbusMaster: Send + Sync {
    fn send_request(&self, hex_frame: &str) -> Result<(), ModbusError>;

    fn is_complete(&self) -> bool;

    /// Last response ADU as hex, `None` if nothing was received.
    fn read_response(&self) -> Option<String>;

    /// Last transmitted ADU as hex.
    fn read_request(&self) -> Option<String>;
}

#[derive(Debug, Default)]
struct Frames {
    request: Option<Vec<u8>>,
    response: Option<Vec<u8>>,
}

/// State of the most recent exchange of a session.
#[derive(Debug, Default)]
pub(crate) struct Exchange {
    frames: Mutex<Frames>,
    complete: AtomicBool,
    in_flight: AtomicBool,
}

impl Exchange {
    /// Claim the session for a new exchange and clear the previous one.
    pub(crate) fn begin(&self) -> Result<InFlight<'_>, ModbusError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ModbusError::Busy);
        }

        *self.frames.lock() = Frames::default();
        self.complete.store(false, Ordering::Release);
        Ok(InFlight { exchange: self })
    }

    pub(crate) fn record_request(&self, request: Vec<u8>) {
        self.frames.lock().request = Some(request);
    }

    /// Store the response and mark the exchange complete. Returns `false`
    /// if it was already complete, in which case nothing is changed.
    pub(crate) fn finish(&self, response: Option<Vec<u8>>) -> bool {
        let mut frames = self.frames.lock();
        if self.complete.swap(true, Ordering::AcqRel) {
            return false;
        }
        frames.response = response;
        true
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub(crate) fn request_hex(&self) -> Option<String> {
        self.frames.lock().request.as_deref().map(bytes_to_hex)
    }

    pub(crate) fn response_hex(&self) -> Option<String> {
        self.frames.lock().response.as_deref().map(bytes_to_hex)
    }
}

/// Held for the duration of `send_request`. Releases the session on drop and
/// makes sure pollers see the exchange as complete even on early errors.
pub(crate) struct InFlight<'a> {
    exchange: &'a Exchange,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.exchange.finish(None);
        self.exchange.in_flight.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_busy() {
        let exchange = Exchange::default();
        let _guard = exchange.begin().unwrap();
        assert!(matches!(exchange.begin(), Err(ModbusError::Busy)));
    }

    #[test]
    fn finish_only_once() {
        let exchange = Exchange::default();
        let guard = exchange.begin().unwrap();
        assert!(exchange.finish(Some(vec![0x01, 0x02])));
        assert!(!exchange.finish(None));
        assert_eq!(exchange.response_hex().as_deref(), Some("01 02 "));
        drop(guard);
        assert!(exchange.is_complete());
    }

    #[test]
    fn begin_clears_previous_exchange() {
        let exchange = Exchange::default();
        {
            let _guard = exchange.begin().unwrap();
            exchange.record_request(vec![0xAA]);
            exchange.finish(Some(vec![0xBB]));
        }
        let _guard = exchange.begin().unwrap();
        assert!(!exchange.is_complete());
        assert_eq!(exchange.request_hex(), None);
        assert_eq!(exchange.response_hex(), None);
    }
}
