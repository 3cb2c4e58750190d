use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("adapter device not found: {0}")]
    AdapterDeviceNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
