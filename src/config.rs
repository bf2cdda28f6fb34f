use std::time::Duration;

use serialport::{DataBits, Parity, StopBits};

pub const DEFAULT_BAUD_RATE: u32 = 19200;
pub const DEFAULT_TCP_PORT: u16 = 502;
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);
/// Silence on the line after which an RTU response is considered finished.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(50);
/// How often the RTU link monitor looks for pending input.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Pause before retrying a TCP read that returned nothing.
pub const DEFAULT_READ_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Serial line settings and exchange timing for an RTU master.
#[derive(Debug, Clone)]
pub struct RtuConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub response_timeout: Duration,
    pub quiet_period: Duration,
    pub poll_interval: Duration,
}

impl RtuConfig {
    /// 19200 baud, even parity, 8 data bits, 1 stop bit.
    pub fn new(port_name: impl Into<String>) -> Self {
        RtuConfig {
            port_name: port_name.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::Even,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            quiet_period: DEFAULT_QUIET_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn builder(port_name: impl Into<String>) -> RtuConfigBuilder {
        RtuConfigBuilder {
            config: RtuConfig::new(port_name),
        }
    }
}

pub struct RtuConfigBuilder {
    config: RtuConfig,
}

impl RtuConfigBuilder {
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.baud_rate = baud_rate;
        self
    }

    pub fn parity(mut self, parity: Parity) -> Self {
        self.config.parity = parity;
        self
    }

    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.config.data_bits = data_bits;
        self
    }

    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.config.stop_bits = stop_bits;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn quiet_period(mut self, quiet_period: Duration) -> Self {
        self.config.quiet_period = quiet_period;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    pub fn build(self) -> RtuConfig {
        self.config
    }
}

/// Server address and exchange timing for a TCP master.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub read_retry_pause: Duration,
}

impl TcpConfig {
    pub fn new(host: impl Into<String>) -> Self {
        TcpConfig {
            host: host.into(),
            port: DEFAULT_TCP_PORT,
            connect_timeout: DEFAULT_RESPONSE_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            read_retry_pause: DEFAULT_READ_RETRY_PAUSE,
        }
    }

    pub fn builder(host: impl Into<String>) -> TcpConfigBuilder {
        TcpConfigBuilder {
            config: TcpConfig::new(host),
        }
    }
}

pub struct TcpConfigBuilder {
    config: TcpConfig,
}

impl TcpConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn read_retry_pause(mut self, pause: Duration) -> Self {
        self.config.read_retry_pause = pause;
        self
    }

    pub fn build(self) -> TcpConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtu_defaults_match_line_settings() {
        let config = RtuConfig::new("/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.response_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn tcp_builder_overrides_port() {
        let config = TcpConfig::builder("10.0.0.2").port(1502).build();
        assert_eq!(config.port, 1502);
        assert_eq!(config.host, "10.0.0.2");
    }
}
