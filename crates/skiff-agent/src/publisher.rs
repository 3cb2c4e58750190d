use async_trait::async_trait;
use skiff_mqtt::{MqttClient, QoS};
use skiff_sensor::{MessagePublisher, PublishQos};

/// Adapts the shared MQTT client to the sensor subsystem's publish seam.
pub struct MqttPublisher {
    pub client: MqttClient,
}

#[async_trait]
impl MessagePublisher for MqttPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: PublishQos,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let qos = match qos {
            PublishQos::AtMostOnce => QoS::AtMostOnce,
            PublishQos::AtLeastOnce => QoS::AtLeastOnce,
        };
        self.client.publish(topic, payload, qos).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}
