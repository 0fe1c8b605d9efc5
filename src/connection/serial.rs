use super::{Connection, ConnectionState};
use crate::error::{ConfigError, TransportError};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

/// Port-level read timeout. Kept tiny so `receive` behaves like a poll.
const POLL_TIMEOUT_MS: u64 = 1;

pub struct SerialConnection {
    device: String,
    baud: u32,
    timeout_ms: u64,
    port: Option<Box<dyn SerialPort>>,
    state: ConnectionState,
}

impl SerialConnection {
    pub fn new(device: String, baud: u32, timeout_ms: u64) -> Self {
        Self {
            device,
            baud,
            timeout_ms,
            port: None,
            state: ConnectionState::Disconnected,
        }
    }

    fn fail(&mut self, err: std::io::Error) -> nb::Error<TransportError> {
        warn!(device = %self.device, error = %err, "serial i/o failed");
        self.port = None;
        self.state = ConnectionState::Error;
        nb::Error::Other(TransportError::Io(err))
    }
}

impl Connection for SerialConnection {
    fn connect(&mut self) -> nb::Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;

        match serialport::new(&self.device, self.baud)
            .timeout(Duration::from_millis(POLL_TIMEOUT_MS))
            .open()
        {
            Ok(port) => {
                self.port = Some(port);
                self.state = ConnectionState::Connected;
                debug!(device = %self.device, baud = self.baud, "serial port opened");
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Error;
                Err(nb::Error::Other(TransportError::Refused(format!(
                    "{}: {err}",
                    self.device
                ))))
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.port = None;
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> nb::Result<usize, TransportError> {
        let port = self
            .port
            .as_mut()
            .ok_or(nb::Error::Other(TransportError::NotConnected))?;
        match port.write(bytes) {
            Ok(n) => Ok(n),
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Err(nb::Error::WouldBlock)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError> {
        let port = self
            .port
            .as_mut()
            .ok_or(nb::Error::Other(TransportError::NotConnected))?;
        match port.read(buf) {
            Ok(0) => Err(nb::Error::WouldBlock),
            Ok(n) => Ok(n),
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Err(nb::Error::WouldBlock)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn check_config(&self) -> Result<(), ConfigError> {
        if self.device.trim().is_empty() {
            return Err(ConfigError::invalid("connection.device", "must not be empty"));
        }
        if self.baud == 0 {
            return Err(ConfigError::invalid("connection.baud", "must not be 0"));
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn describe(&self) -> String {
        format!("serial {}@{}", self.device, self.baud)
    }
}
