use super::{Connection, ConnectionState};
use crate::error::{ConfigError, TransportError};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest a single `connect` call may block. The driver keeps calling until
/// its own connection timeout expires.
const CONNECT_SLICE_MS: u64 = 250;

#[derive(Debug)]
pub struct TcpConnection {
    host: String,
    port: u16,
    timeout_ms: u64,
    stream: Option<TcpStream>,
    state: ConnectionState,
}

impl TcpConnection {
    pub fn new(host: String, port: u16, timeout_ms: u64) -> Self {
        Self {
            host,
            port,
            timeout_ms,
            stream: None,
            state: ConnectionState::Disconnected,
        }
    }

    fn resolve(&self) -> Result<SocketAddr, TransportError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve(self.host.clone()))?
            .next()
            .ok_or_else(|| TransportError::Resolve(self.host.clone()))
    }

    fn fail(&mut self, err: std::io::Error) -> nb::Error<TransportError> {
        warn!(peer = %self.describe(), error = %err, "tcp i/o failed");
        self.stream = None;
        self.state = ConnectionState::Error;
        nb::Error::Other(TransportError::Io(err))
    }
}

impl Connection for TcpConnection {
    fn connect(&mut self) -> nb::Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;

        let addr = self.resolve().map_err(|err| {
            self.state = ConnectionState::Error;
            nb::Error::Other(err)
        })?;
        let slice = Duration::from_millis(self.timeout_ms.clamp(1, CONNECT_SLICE_MS));

        match TcpStream::connect_timeout(&addr, slice) {
            Ok(stream) => {
                stream.set_nonblocking(true).map_err(|e| self.fail(e))?;
                let _ = stream.set_nodelay(true);
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                debug!(peer = %addr, "tcp connected");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::TimedOut || err.kind() == ErrorKind::WouldBlock => {
                Err(nb::Error::WouldBlock)
            }
            Err(err) => {
                self.state = ConnectionState::Error;
                Err(nb::Error::Other(TransportError::Refused(format!("{addr}: {err}"))))
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> nb::Result<usize, TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(nb::Error::Other(TransportError::NotConnected))?;
        match stream.write(bytes) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(nb::Error::Other(TransportError::NotConnected))?;
        match stream.read(buf) {
            Ok(0) => {
                self.stream = None;
                self.state = ConnectionState::Disconnected;
                Err(nb::Error::Other(TransportError::Closed))
            }
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn check_config(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("connection.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("connection.port", "must not be 0"));
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
        format!("tcp {}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_send_before_connect_fails() {
        let mut connection = TcpConnection::new("127.0.0.1".into(), 1, 100);
        assert!(matches!(
            connection.send(b"x"),
            Err(nb::Error::Other(TransportError::NotConnected))
        ));
    }

    #[test]
    fn test_loopback_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut connection = TcpConnection::new("127.0.0.1".into(), port, 1_000);

        nb::block!(connection.connect()).unwrap();
        assert!(connection.is_connected());

        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(connection.send(b"{ping}").unwrap(), 6);

        let mut echo = [0u8; 6];
        peer.read_exact(&mut echo).unwrap();
        peer.write_all(&echo).unwrap();

        let mut buf = [0u8; 16];
        let n = loop {
            match connection.receive(&mut buf) {
                Ok(n) => break n,
                Err(nb::Error::WouldBlock) => std::thread::yield_now(),
                Err(nb::Error::Other(e)) => panic!("receive failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"{ping}");

        drop(peer);
        connection.disconnect().unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
