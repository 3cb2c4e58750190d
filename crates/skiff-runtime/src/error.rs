use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("image not present: {0}")]
    ImageNotPresent(String),

    #[error("invalid container labels on {container_id}: {message}")]
    InvalidLabels {
        container_id: String,
        message: String,
    },

    #[error("invalid port mapping '{0}'")]
    InvalidPortMapping(String),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
