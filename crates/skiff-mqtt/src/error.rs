use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("invalid broker url: {0}")]
    InvalidBrokerUrl(String),

    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),

    #[error("not connected")]
    NotConnected,

    #[error("broker connection timed out")]
    ConnectTimeout,

    #[error("client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}
