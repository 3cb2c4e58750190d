use std::time::Duration;

use async_trait::async_trait;
use skiff_domain::{Connection, FunctionCode, Parity, QualityCode};
use thiserror::Error;
use tokio_modbus::client::{rtu, tcp, Context, Reader};
use tokio_modbus::slave::Slave;
use tracing::debug;

use crate::decode::classify_io_error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("modbus exception: {0}")]
    Exception(String),

    #[error("read timed out")]
    Timeout,

    #[error("unsupported connection type")]
    Unsupported,
}

impl TransportError {
    pub fn quality_code(&self) -> QualityCode {
        match self {
            TransportError::Io(e) => classify_io_error(e),
            TransportError::Exception(_) => QualityCode::ModbusException,
            TransportError::Timeout => QualityCode::Timeout,
            TransportError::Unsupported => QualityCode::ReadError,
        }
    }

    /// Whether the underlying connection is unusable after this error.
    /// Modbus exceptions are per-request; everything else kills the link.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Exception(_))
    }
}

/// One connected field device, able to serve register and bit reads.
#[async_trait]
pub trait RegisterSource: Send {
    async fn read_bits(
        &mut self,
        function: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_registers(
        &mut self,
        function: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn close(&mut self);
}

/// Opens transports for device rows. The production implementation speaks
/// Modbus TCP/RTU; tests substitute scripted sources.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        connection: &Connection,
    ) -> Result<Box<dyn RegisterSource>, TransportError>;
}

// ── tokio-modbus implementation ───────────────────────────────────────────────

pub struct ModbusTransport {
    ctx: Context,
    timeout: Duration,
}

fn flatten<T>(
    result: Result<Result<T, tokio_modbus::Exception>, tokio_modbus::Error>,
) -> Result<T, TransportError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(TransportError::Exception(exception.to_string())),
        Err(tokio_modbus::Error::Transport(e)) => Err(TransportError::Io(e)),
        Err(e @ tokio_modbus::Error::Protocol(_)) => {
            Err(TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
        }
    }
}

#[async_trait]
impl RegisterSource for ModbusTransport {
    async fn read_bits(
        &mut self,
        function: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let timeout = self.timeout;
        match function {
            FunctionCode::ReadCoils => {
                match tokio::time::timeout(timeout, self.ctx.read_coils(address, count)).await {
                    Ok(result) => flatten(result),
                    Err(_) => Err(TransportError::Timeout),
                }
            }
            FunctionCode::ReadDiscreteInputs => {
                match tokio::time::timeout(timeout, self.ctx.read_discrete_inputs(address, count))
                    .await
                {
                    Ok(result) => flatten(result),
                    Err(_) => Err(TransportError::Timeout),
                }
            }
            _ => Err(TransportError::Unsupported),
        }
    }

    async fn read_registers(
        &mut self,
        function: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let timeout = self.timeout;
        match function {
            FunctionCode::ReadHoldingRegisters => {
                match tokio::time::timeout(timeout, self.ctx.read_holding_registers(address, count))
                    .await
                {
                    Ok(result) => flatten(result),
                    Err(_) => Err(TransportError::Timeout),
                }
            }
            FunctionCode::ReadInputRegisters => {
                match tokio::time::timeout(timeout, self.ctx.read_input_registers(address, count))
                    .await
                {
                    Ok(result) => flatten(result),
                    Err(_) => Err(TransportError::Timeout),
                }
            }
            _ => Err(TransportError::Unsupported),
        }
    }

    async fn close(&mut self) {
        let _ = self.ctx.disconnect().await;
    }
}

/// Production connector: Modbus over TCP or serial RTU.
#[derive(Debug, Default, Clone)]
pub struct ModbusConnector;

impl ModbusConnector {
    pub fn new() -> Self {
        Self
    }
}

fn serial_to_io(e: tokio_serial::Error) -> std::io::Error {
    use tokio_serial::ErrorKind;
    let kind = match e.kind() {
        ErrorKind::NoDevice => std::io::ErrorKind::NotFound,
        ErrorKind::Io(kind) => kind,
        _ => std::io::ErrorKind::Other,
    };
    std::io::Error::new(kind, e.to_string())
}

#[async_trait]
impl Connector for ModbusConnector {
    async fn connect(
        &self,
        connection: &Connection,
    ) -> Result<Box<dyn RegisterSource>, TransportError> {
        match connection {
            Connection::ModbusTcp { host, port, unit_id, timeout_ms } => {
                let timeout = Duration::from_millis(*timeout_ms);
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        TransportError::Io(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("no address for {}", host),
                        ))
                    })?;
                debug!(%addr, unit_id, "connecting modbus tcp");
                let ctx = tokio::time::timeout(timeout, tcp::connect_slave(addr, Slave(*unit_id)))
                    .await
                    .map_err(|_| TransportError::Timeout)??;
                Ok(Box::new(ModbusTransport { ctx, timeout }))
            }
            Connection::ModbusRtu {
                port,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
                unit_id,
                timeout_ms,
            } => {
                let timeout = Duration::from_millis(*timeout_ms);
                let builder = tokio_serial::new(port, *baud_rate)
                    .data_bits(match data_bits {
                        5 => tokio_serial::DataBits::Five,
                        6 => tokio_serial::DataBits::Six,
                        7 => tokio_serial::DataBits::Seven,
                        _ => tokio_serial::DataBits::Eight,
                    })
                    .stop_bits(match stop_bits {
                        2 => tokio_serial::StopBits::Two,
                        _ => tokio_serial::StopBits::One,
                    })
                    .parity(match parity {
                        Parity::None => tokio_serial::Parity::None,
                        Parity::Even => tokio_serial::Parity::Even,
                        Parity::Odd => tokio_serial::Parity::Odd,
                    })
                    .timeout(timeout);
                debug!(port = %port, baud = baud_rate, "attaching modbus rtu");
                let stream =
                    tokio_serial::SerialStream::open(&builder).map_err(serial_to_io)?;
                let ctx = rtu::attach_slave(stream, Slave(*unit_id));
                Ok(Box::new(ModbusTransport { ctx, timeout }))
            }
            Connection::Opcua { .. } | Connection::Can { .. } => Err(TransportError::Unsupported),
        }
    }
}
