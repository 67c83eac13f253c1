//! The seam between the polling engine and the physical device.
//!
//! The engine only ever talks to a [`Transport`]: it reads contiguous register
//! blocks and writes single registers. Framing, CRCs and serial timing below
//! that are the transport's business. A `tokio-modbus` implementation is
//! available in [`crate::tokio_common`].

use crate::catalog::FunctionKind;
use async_trait::async_trait;

/// Failure of a single transport operation. Recovered per block by the engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No open connection to the device.
    #[error("Not connected")]
    NotConnected,

    /// Opening the connection failed.
    #[error("Cannot connect: {0}")]
    Connect(String),

    /// The device did not answer in time.
    #[error("Operation timed out")]
    Timeout,

    /// The device answered with a malformed frame or an exception.
    #[error("Frame error: {0}")]
    Frame(String),
}

/// Block-level access to a device's registers.
///
/// Implementations are driven by exactly one worker; calls never overlap.
#[async_trait]
pub trait Transport: Send {
    /// Opens (or reopens) the connection.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Whether the last known state of the connection is open.
    fn is_connected(&self) -> bool;

    /// Reads `length` consecutive registers starting at `start`.
    async fn read_block(
        &mut self,
        kind: FunctionKind,
        start: u16,
        length: u16,
        unit_id: u8,
    ) -> Result<Vec<u16>, TransportError>;

    /// Writes one holding register.
    async fn write_register(
        &mut self,
        address: u16,
        raw: u16,
        unit_id: u8,
    ) -> Result<(), TransportError>;

    /// Closes the connection. Errors are swallowed; there is nothing left to do.
    async fn close(&mut self);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub(crate) struct MockState {
        pub connected: bool,
        pub closed: bool,
        pub connect_failures: usize,
        pub connect_attempts: usize,
        pub registers: HashMap<(FunctionKind, u16), u16>,
        pub failing: HashSet<(FunctionKind, u16)>,
        /// Returned block is one word short when its start is listed here.
        pub truncated: HashSet<(FunctionKind, u16)>,
        pub reads: Vec<(FunctionKind, u16, u16)>,
        pub writes: Vec<(u16, u16)>,
    }

    /// In-memory device. The state is shared so tests can inspect it while
    /// the engine owns the transport.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MockTransport {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn connected() -> Self {
            let mock = Self::default();
            mock.state.lock().unwrap().connected = true;
            mock
        }

        pub fn set(&self, kind: FunctionKind, address: u16, raw: u16) {
            self.state
                .lock()
                .unwrap()
                .registers
                .insert((kind, address), raw);
        }

        pub fn reads_of(&self, kind: FunctionKind, start: u16) -> usize {
            self.state
                .lock()
                .unwrap()
                .reads
                .iter()
                .filter(|(k, s, _)| *k == kind && *s == start)
                .count()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.connect_attempts += 1;
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(TransportError::Connect("port busy".to_string()));
            }
            state.connected = true;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.state.lock().unwrap().connected
        }

        async fn read_block(
            &mut self,
            kind: FunctionKind,
            start: u16,
            length: u16,
            _unit_id: u8,
        ) -> Result<Vec<u16>, TransportError> {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.reads.push((kind, start, length));
            if state.failing.contains(&(kind, start)) {
                return Err(TransportError::Frame("illegal data address".to_string()));
            }
            let mut words: Vec<u16> = (start..start + length)
                .map(|address| {
                    state
                        .registers
                        .get(&(kind, address))
                        .copied()
                        .unwrap_or_default()
                })
                .collect();
            if state.truncated.contains(&(kind, start)) {
                words.pop();
            }
            Ok(words)
        }

        async fn write_register(
            &mut self,
            address: u16,
            raw: u16,
            _unit_id: u8,
        ) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.writes.push((address, raw));
            state.registers.insert((FunctionKind::Holding, address), raw);
            Ok(())
        }

        async fn close(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.connected = false;
            state.closed = true;
        }
    }
}
