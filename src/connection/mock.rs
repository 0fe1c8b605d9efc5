//! Scripted in-memory transport for tests.
//!
//! The driver owns the [`MockConnection`]; the test keeps a [`MockHandle`]
//! onto the same state to feed replies, inject failures and inspect what was
//! sent.

use super::{Connection, ConnectionState};
use crate::error::{ConfigError, TransportError};
use crate::protocol::{expected_length, Frame};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Ready,
    Pending,
    Refused,
}

pub type Responder = Box<dyn FnMut(&Frame) -> Option<Vec<u8>>>;

#[derive(Default)]
struct MockState {
    state: Option<ConnectionState>,
    connect_script: VecDeque<ConnectOutcome>,
    tx_pending: Vec<u8>,
    sent: Vec<Vec<u8>>,
    inbound: VecDeque<u8>,
    fail_next_send: bool,
    fail_next_receive: bool,
    max_send_chunk: Option<usize>,
    responder: Option<Responder>,
    connect_calls: u32,
    disconnect_calls: u32,
}

impl MockState {
    fn link(&self) -> ConnectionState {
        self.state.unwrap_or(ConnectionState::Disconnected)
    }
}

pub struct MockConnection {
    shared: Rc<RefCell<MockState>>,
    timeout_ms: u64,
}

#[derive(Clone)]
pub struct MockHandle {
    shared: Rc<RefCell<MockState>>,
}

impl MockConnection {
    pub fn new(timeout_ms: u64) -> (Self, MockHandle) {
        let shared = Rc::new(RefCell::new(MockState::default()));
        (
            Self {
                shared: shared.clone(),
                timeout_ms,
            },
            MockHandle { shared },
        )
    }

    /// Hand every complete outgoing telegram to the responder.
    fn flush_outgoing(&mut self) {
        loop {
            let telegram = {
                let mut state = self.shared.borrow_mut();
                let total = match expected_length(&state.tx_pending) {
                    Ok(Some(total)) if state.tx_pending.len() >= total => total,
                    Ok(_) => return,
                    Err(_) => {
                        let junk = std::mem::take(&mut state.tx_pending);
                        state.sent.push(junk);
                        return;
                    }
                };
                let telegram: Vec<u8> = state.tx_pending.drain(..total).collect();
                state.sent.push(telegram.clone());
                telegram
            };

            let Ok(frame) = Frame::parse_unverified(&telegram) else {
                continue;
            };
            let responder = self.shared.borrow_mut().responder.take();
            if let Some(mut responder) = responder {
                let reply = responder(&frame);
                let mut state = self.shared.borrow_mut();
                if let Some(reply) = reply {
                    state.inbound.extend(reply);
                }
                if state.responder.is_none() {
                    state.responder = Some(responder);
                }
            }
        }
    }
}

impl Connection for MockConnection {
    fn connect(&mut self) -> nb::Result<(), TransportError> {
        let mut state = self.shared.borrow_mut();
        state.connect_calls += 1;
        if state.link() == ConnectionState::Connected {
            return Ok(());
        }
        match state.connect_script.pop_front().unwrap_or(ConnectOutcome::Ready) {
            ConnectOutcome::Ready => {
                state.state = Some(ConnectionState::Connected);
                Ok(())
            }
            ConnectOutcome::Pending => {
                state.state = Some(ConnectionState::Connecting);
                Err(nb::Error::WouldBlock)
            }
            ConnectOutcome::Refused => {
                state.state = Some(ConnectionState::Error);
                Err(nb::Error::Other(TransportError::Refused("scripted".into())))
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.shared.borrow_mut();
        state.disconnect_calls += 1;
        state.state = Some(ConnectionState::Disconnected);
        state.tx_pending.clear();
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> nb::Result<usize, TransportError> {
        let accepted = {
            let mut state = self.shared.borrow_mut();
            if state.link() != ConnectionState::Connected {
                return Err(nb::Error::Other(TransportError::NotConnected));
            }
            if std::mem::take(&mut state.fail_next_send) {
                state.state = Some(ConnectionState::Error);
                return Err(nb::Error::Other(TransportError::Closed));
            }
            let accepted = state.max_send_chunk.map_or(bytes.len(), |max| max.min(bytes.len()));
            state.tx_pending.extend_from_slice(&bytes[..accepted]);
            accepted
        };
        self.flush_outgoing();
        Ok(accepted)
    }

    fn receive(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError> {
        let mut state = self.shared.borrow_mut();
        if state.link() != ConnectionState::Connected {
            return Err(nb::Error::Other(TransportError::NotConnected));
        }
        if std::mem::take(&mut state.fail_next_receive) {
            state.state = Some(ConnectionState::Disconnected);
            return Err(nb::Error::Other(TransportError::Closed));
        }
        if state.inbound.is_empty() {
            return Err(nb::Error::WouldBlock);
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn check_config(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.shared.borrow().link()
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn describe(&self) -> String {
        "mock".to_owned()
    }
}

impl MockHandle {
    /// Outcomes for the next `connect` calls; once exhausted, connects succeed.
    pub fn script_connect(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.shared.borrow_mut().connect_script.extend(outcomes);
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.shared.borrow_mut().inbound.extend(bytes.iter().copied());
    }

    pub fn push_frame(&self, frame: &Frame) {
        if let Ok(wire) = frame.encode() {
            self.push_inbound(&wire);
        }
    }

    pub fn set_responder(&self, responder: impl FnMut(&Frame) -> Option<Vec<u8>> + 'static) {
        self.shared.borrow_mut().responder = Some(Box::new(responder));
    }

    pub fn clear_responder(&self) {
        self.shared.borrow_mut().responder = None;
    }

    pub fn fail_next_send(&self) {
        self.shared.borrow_mut().fail_next_send = true;
    }

    pub fn fail_next_receive(&self) {
        self.shared.borrow_mut().fail_next_receive = true;
    }

    /// Accept at most `max` bytes per `send` call.
    pub fn limit_send_chunk(&self, max: usize) {
        self.shared.borrow_mut().max_send_chunk = Some(max.max(1));
    }

    /// Raw telegrams written so far.
    pub fn sent_telegrams(&self) -> Vec<Vec<u8>> {
        self.shared.borrow().sent.clone()
    }

    pub fn sent_frames(&self) -> Vec<Frame> {
        self.shared
            .borrow()
            .sent
            .iter()
            .filter_map(|raw| Frame::parse_unverified(raw).ok())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.shared.borrow_mut().sent.clear();
    }

    pub fn connect_calls(&self) -> u32 {
        self.shared.borrow().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.shared.borrow().disconnect_calls
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.borrow().link()
    }

    pub fn pending_inbound(&self) -> usize {
        self.shared.borrow().inbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QUERY_PORT;

    #[test]
    fn test_scripted_connect() {
        let (mut connection, handle) = MockConnection::new(1_000);
        handle.script_connect([ConnectOutcome::Pending, ConnectOutcome::Refused]);

        assert!(matches!(connection.connect(), Err(nb::Error::WouldBlock)));
        assert!(matches!(connection.connect(), Err(nb::Error::Other(_))));
        assert!(connection.connect().is_ok());
        assert_eq!(handle.connect_calls(), 3);
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_responder_answers_complete_telegrams() {
        let (mut connection, handle) = MockConnection::new(1_000);
        handle.set_responder(|frame| {
            Frame::new(frame.address, QUERY_PORT, b"PAC=10".to_vec())
                .encode()
                .ok()
                .map(|wire| wire.to_vec())
        });
        handle.limit_send_chunk(4);
        connection.connect().unwrap();

        let wire = Frame::query(3, &["PAC"]).encode().unwrap();
        let mut offset = 0;
        while offset < wire.len() {
            offset += connection.send(&wire[offset..]).unwrap();
        }
        assert_eq!(handle.sent_frames().len(), 1);

        let mut buf = [0u8; 64];
        let n = connection.receive(&mut buf).unwrap();
        let reply = Frame::decode(&buf[..n]).unwrap();
        assert_eq!(reply.address, 3);
        assert_eq!(reply.payload, b"PAC=10");
    }

    #[test]
    fn test_receive_failure_drops_link() {
        let (mut connection, handle) = MockConnection::new(1_000);
        connection.connect().unwrap();
        handle.fail_next_receive();

        let mut buf = [0u8; 8];
        assert!(matches!(
            connection.receive(&mut buf),
            Err(nb::Error::Other(TransportError::Closed))
        ));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
