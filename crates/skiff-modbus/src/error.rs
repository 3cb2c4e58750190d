use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("device validation failed: {0}")]
    Validation(#[from] skiff_domain::DomainError),

    #[error("store error: {0}")]
    Store(#[from] skiff_store::StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
