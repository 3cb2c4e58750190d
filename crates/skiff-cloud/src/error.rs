use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cloud returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("authentication rejected")]
    Unauthorized,

    #[error("application id mismatch: device registered to {registered}, configured {configured}")]
    ApplicationMismatch { registered: i64, configured: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] skiff_store::StoreError),
}
