pub mod client;
pub mod decode;
pub mod error;
pub mod manager;
pub mod output;
pub mod transport;

pub use client::{offline_samples, poll_device, ConnectionState, DeviceClient};
pub use decode::{classify_io_error, decode_bits, decode_registers};
pub use error::AdapterError;
pub use manager::AdapterManager;
pub use output::{OutputServer, SampleWriter};
pub use transport::{Connector, ModbusConnector, RegisterSource, TransportError};
