//! Byte transports consumed by drivers.
//!
//! Every operation returns immediately. `nb::Error::WouldBlock` means "not
//! yet, ask again later"; the driver turns that into a rescheduled command
//! instead of waiting.

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;

use crate::config::ConnectionConfig;
use crate::error::{ConfigError, TransportError};
use crate::simulator::SimulatedInverter;
use serde::{Deserialize, Serialize};

pub use mock::{ConnectOutcome, MockConnection, MockHandle};
#[cfg(feature = "serial")]
pub use serial::SerialConnection;
pub use tcp::TcpConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

pub trait Connection {
    /// Start or continue establishing the link.
    fn connect(&mut self) -> nb::Result<(), TransportError>;

    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Write as much of `bytes` as the transport accepts right now.
    fn send(&mut self, bytes: &[u8]) -> nb::Result<usize, TransportError>;

    /// Read whatever is available into `buf`.
    fn receive(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError>;

    fn check_config(&self) -> Result<(), ConfigError>;

    fn state(&self) -> ConnectionState;

    /// Bound on connection establishment and on waiting for a reply.
    fn timeout_ms(&self) -> u64;

    fn describe(&self) -> String;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Build the transport selected by `config.transport`.
pub fn create_connection(config: &ConnectionConfig) -> Result<Box<dyn Connection>, ConfigError> {
    let connection: Box<dyn Connection> = match config {
        ConnectionConfig::Tcp {
            host,
            port,
            timeout_ms,
        } => Box::new(TcpConnection::new(host.clone(), *port, *timeout_ms)),
        ConnectionConfig::Serial {
            device,
            baud,
            timeout_ms,
        } => serial_connection(device, *baud, *timeout_ms)?,
        ConnectionConfig::Simulator {
            model,
            faults,
            timeout_ms,
        } => Box::new(SimulatedInverter::new(*model, faults.clone(), *timeout_ms)),
    };
    connection.check_config()?;
    Ok(connection)
}

#[cfg(feature = "serial")]
fn serial_connection(device: &str, baud: u32, timeout_ms: u64) -> Result<Box<dyn Connection>, ConfigError> {
    Ok(Box::new(SerialConnection::new(device.to_owned(), baud, timeout_ms)))
}

#[cfg(not(feature = "serial"))]
fn serial_connection(device: &str, _baud: u32, _timeout_ms: u64) -> Result<Box<dyn Connection>, ConfigError> {
    let _ = device;
    Err(ConfigError::UnsupportedTransport("serial".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::FaultInjectionConfig;

    #[test]
    fn test_factory_builds_tcp() {
        let config = ConnectionConfig::Tcp {
            host: "127.0.0.1".into(),
            port: 12345,
            timeout_ms: 15_000,
        };
        let connection = create_connection(&config).unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.timeout_ms(), 15_000);
    }

    #[test]
    fn test_factory_rejects_bad_tcp_config() {
        let config = ConnectionConfig::Tcp {
            host: String::new(),
            port: 12345,
            timeout_ms: 15_000,
        };
        assert!(matches!(
            create_connection(&config),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_factory_builds_simulator() {
        let config = ConnectionConfig::Simulator {
            model: 2001,
            faults: FaultInjectionConfig::disabled(),
            timeout_ms: 1_000,
        };
        let connection = create_connection(&config).unwrap();
        assert!(connection.describe().contains("simulated"));
    }

    #[cfg(not(feature = "serial"))]
    #[test]
    fn test_serial_needs_feature() {
        let config = ConnectionConfig::Serial {
            device: "/dev/ttyUSB0".into(),
            baud: 19_200,
            timeout_ms: 15_000,
        };
        assert!(matches!(
            create_connection(&config),
            Err(ConfigError::UnsupportedTransport(_))
        ));
    }
}
