pub mod client;
pub mod error;
pub mod topic;

pub use client::{ConnectOptions, InboundMessage, MessageHandler, MqttClient};
pub use error::MqttError;
pub use topic::{topic_matches, valid_filter};

pub use rumqttc::QoS;
