use skiff_domain::AppId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("app not found: {0}")]
    AppNotFound(AppId),

    #[error("app {0} has more than one service; operation needs exactly one")]
    AmbiguousApp(AppId),

    #[error("reconciliation in progress")]
    Busy,

    #[error("runtime error: {0}")]
    Runtime(#[from] skiff_runtime::RuntimeError),

    #[error("store error: {0}")]
    Store(#[from] skiff_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
