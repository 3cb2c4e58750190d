use std::sync::Arc;

use serde_json::json;
use skiff_domain::{shadow_topic, DeviceState, ShadowOp, ShadowResult};
use skiff_mqtt::{InboundMessage, MqttClient, MqttError, QoS};
use tracing::{info, warn};

const APPS_SHADOW: &str = "apps";

/// Keeps the device's `apps` shadow in step with what is actually running:
/// publishes reported state after every successful reconcile and listens for
/// cloud-computed deltas.
pub struct ShadowReporter {
    client: MqttClient,
    uuid: String,
}

impl ShadowReporter {
    pub fn new(client: MqttClient, uuid: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { client, uuid: uuid.into() })
    }

    /// Subscribe to the delta stream. Deltas arrive when the cloud decides
    /// the reported document lags desired; the poll loop converges soon
    /// after, so receipt is logged rather than acted on directly.
    pub async fn subscribe_delta(&self) -> Result<(), MqttError> {
        let topic = shadow_topic(&self.uuid, APPS_SHADOW, ShadowOp::Update, Some(ShadowResult::Delta));
        self.client
            .subscribe(
                &topic,
                QoS::AtLeastOnce,
                Arc::new(|message: &InboundMessage| -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                    let document: serde_json::Value = serde_json::from_slice(&message.payload)?;
                    info!(
                        version = document.get("version").and_then(|v| v.as_u64()),
                        "shadow delta received"
                    );
                    Ok(())
                }),
            )
            .await
    }

    /// Publish the reported side of the shadow document.
    pub async fn report(&self, state: &DeviceState) {
        if !self.client.is_connected() {
            return;
        }
        let topic = shadow_topic(&self.uuid, APPS_SHADOW, ShadowOp::Update, None);
        let payload = json!({
            "state": { "reported": { "apps": state.apps } },
            "client_token": self.uuid,
        });
        let Ok(bytes) = serde_json::to_vec(&payload) else { return };
        if let Err(e) = self.client.publish(&topic, bytes, QoS::AtLeastOnce).await {
            warn!(error = %e, "shadow report failed");
        }
    }
}
