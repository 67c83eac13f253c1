//! [`Transport`] implementation on top of `tokio-modbus`.
//!
//! The device is reached either over a serial line (RTU, 8N1 without flow
//! control) or through a Modbus TCP gateway.

use crate::catalog::FunctionKind;
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Client, Reader, Slave, SlaveContext, Writer};

/// The parity used for serial communication.
#[cfg(feature = "tokio-rtu")]
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
/// The number of stop bits used for serial communication.
#[cfg(feature = "tokio-rtu")]
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
#[cfg(feature = "tokio-rtu")]
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

/// Creates a `tokio_serial::SerialPortBuilder` with the specified settings.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
/// * `baud_rate` - The baud rate for the serial communication.
#[cfg(feature = "tokio-rtu")]
pub fn serial_port_builder(device: &str, baud_rate: u32) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, baud_rate)
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}

/// Where the device is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(feature = "tokio-rtu")]
    Rtu { device: String, baud_rate: u32 },
    #[cfg(feature = "tokio-tcp")]
    Tcp(std::net::SocketAddr),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "tokio-rtu")]
            Endpoint::Rtu { device, baud_rate } => write!(f, "{device} at {baud_rate} baud"),
            #[cfg(feature = "tokio-tcp")]
            Endpoint::Tcp(address) => write!(f, "{address}"),
        }
    }
}

impl From<tokio_modbus::Error> for TransportError {
    fn from(error: tokio_modbus::Error) -> Self {
        match error {
            tokio_modbus::Error::Transport(error) if error.kind() == std::io::ErrorKind::TimedOut => {
                TransportError::Timeout
            }
            error => TransportError::Frame(error.to_string()),
        }
    }
}

/// A device connection that is opened on demand and dropped on I/O errors.
pub struct ModbusTransport {
    endpoint: Endpoint,
    ctx: Option<Context>,
}

impl ModbusTransport {
    /// A transport for `endpoint`. Nothing is opened until the first connect.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ctx: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The open context addressed to `unit_id`.
    fn context(&mut self, unit_id: u8) -> Result<&mut Context, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(unit_id));
        Ok(ctx)
    }

    /// Flattens a `tokio-modbus` result. A broken line invalidates the
    /// context so that the next operation reconnects.
    fn check<T>(&mut self, result: tokio_modbus::Result<T>) -> Result<T, TransportError> {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(exception)) => Err(TransportError::Frame(exception.to_string())),
            Err(error) => {
                if matches!(error, tokio_modbus::Error::Transport(_)) {
                    self.ctx = None;
                }
                Err(error.into())
            }
        }
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
        let ctx = match &self.endpoint {
            #[cfg(feature = "tokio-rtu")]
            Endpoint::Rtu { device, baud_rate } => {
                let port = tokio_serial::SerialStream::open(&serial_port_builder(device, *baud_rate))
                    .map_err(|error| TransportError::Connect(error.to_string()))?;
                tokio_modbus::client::rtu::attach(port)
            }
            #[cfg(feature = "tokio-tcp")]
            Endpoint::Tcp(address) => tokio_modbus::client::tcp::connect(*address)
                .await
                .map_err(|error| TransportError::Connect(error.to_string()))?,
        };
        self.ctx = Some(ctx);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_block(
        &mut self,
        kind: FunctionKind,
        start: u16,
        length: u16,
        unit_id: u8,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self.context(unit_id)?;
        let result = match kind {
            FunctionKind::Holding => ctx.read_holding_registers(start, length).await,
            FunctionKind::Input => ctx.read_input_registers(start, length).await,
        };
        self.check(result)
    }

    async fn write_register(
        &mut self,
        address: u16,
        raw: u16,
        unit_id: u8,
    ) -> Result<(), TransportError> {
        let ctx = self.context(unit_id)?;
        let result = ctx.write_single_register(address, raw).await;
        self.check(result)
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(error) = ctx.disconnect().await {
                log::debug!("Closing {} failed: {error}", self.endpoint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn timeouts_are_recognized() {
        let error = tokio_modbus::Error::Transport(std::io::ErrorKind::TimedOut.into());
        assert_eq!(TransportError::from(error), TransportError::Timeout);

        let error = tokio_modbus::Error::Transport(std::io::ErrorKind::BrokenPipe.into());
        assert_matches!(TransportError::from(error), TransportError::Frame(_));
    }

    #[cfg(feature = "tokio-tcp")]
    #[tokio::test]
    async fn operations_need_a_connection() {
        let mut transport = ModbusTransport::new(Endpoint::Tcp(([127, 0, 0, 1], 502).into()));
        assert!(!transport.is_connected());
        assert_eq!(
            transport.read_block(FunctionKind::Holding, 0, 1, 1).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport.write_register(0, 1, 1).await,
            Err(TransportError::NotConnected)
        );
        transport.close().await;
        assert!(!transport.is_connected());
    }

    #[cfg(feature = "tokio-tcp")]
    #[tokio::test]
    async fn reconnect_and_close_disconnect_the_context() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let gateway = tokio::spawn(async move {
            let mut peers = Vec::new();
            for _ in 0..2 {
                peers.push(listener.accept().await.unwrap());
            }
            peers
        });

        let mut transport = ModbusTransport::new(Endpoint::Tcp(address));
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        transport.close().await;
        assert!(!transport.is_connected());
        assert_eq!(gateway.await.unwrap().len(), 2);
    }
}
