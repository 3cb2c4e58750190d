use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid adapter device '{name}': {message}")]
    InvalidAdapterDevice { name: String, message: String },

    #[error("invalid data point '{name}': {message}")]
    InvalidDataPoint { name: String, message: String },

    #[error("connection type {connection} does not match protocol {protocol}")]
    ConnectionProtocolMismatch {
        connection: String,
        protocol: String,
    },

    #[error("invalid function code: {0}")]
    InvalidFunctionCode(u8),

    #[error("device identity violates provisioning invariant: {0}")]
    IdentityInvariant(String),
}
