use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishQos {
    AtMostOnce,
    AtLeastOnce,
}

/// The slice of the MQTT client a sensor needs. Sensors hold this instead of
/// the concrete client so the stats surface never cycles back through MQTT.
#[async_trait]
pub trait MessagePublisher: Send + Sync + 'static {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: PublishQos,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    fn is_connected(&self) -> bool;
}
