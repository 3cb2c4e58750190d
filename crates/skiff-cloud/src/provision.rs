use std::sync::Arc;

use chrono::Utc;
use skiff_domain::DeviceIdentity;
use skiff_store::DeviceStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::client::{CloudClient, RegisterRequest};
use crate::error::CloudError;

/// Environment-supplied provisioning inputs.
#[derive(Debug, Clone, Default)]
pub struct ProvisionSettings {
    pub api_endpoint: Option<String>,
    pub provisioning_api_key: Option<String>,
    pub device_name: String,
    pub device_type: String,
    pub application_id: Option<i64>,
    pub mac_address: Option<String>,
    pub os_version: Option<String>,
    pub agent_version: Option<String>,
}

/// Load (or bootstrap) the device identity and run the two-phase exchange if
/// the device is not yet provisioned.
///
/// Any phase failing leaves `provisioned = false` with the provisioning key
/// intact, so the call is safe to retry.
pub async fn ensure_provisioned(
    store: &Arc<dyn DeviceStore>,
    settings: &ProvisionSettings,
) -> Result<DeviceIdentity, CloudError> {
    // Phase 1: uuid + device key exist from the first boot onwards.
    let mut identity = match store.load_identity().await? {
        Some(identity) => identity,
        None => {
            let identity =
                DeviceIdentity::bootstrap(&settings.device_name, &settings.device_type);
            info!(uuid = %identity.uuid, "generated device identity");
            store.save_identity(&identity).await?;
            identity
        }
    };

    // Refuse a key for a different fleet than the one we registered with.
    if let (Some(registered), Some(configured)) =
        (identity.application_id, settings.application_id)
    {
        if registered != configured {
            return Err(CloudError::ApplicationMismatch { registered, configured });
        }
    }

    if identity.provisioned {
        return Ok(identity);
    }

    let (Some(endpoint), Some(provisioning_key)) =
        (&settings.api_endpoint, &settings.provisioning_api_key)
    else {
        // Nothing to do: the device runs unprovisioned (local-only mode).
        return Ok(identity);
    };

    // Persist the inputs before talking to the cloud so a crash mid-exchange
    // retries with the same state.
    identity.api_endpoint = Some(endpoint.clone());
    identity.provisioning_api_key = Some(provisioning_key.clone());
    identity.application_id = settings.application_id;
    identity.mac_address = settings.mac_address.clone();
    identity.os_version = settings.os_version.clone();
    identity.agent_version = settings.agent_version.clone();
    store.save_identity(&identity).await?;

    let client = CloudClient::new(endpoint)?;

    // Phase 2: register under the fleet key.
    let response = client
        .register(
            provisioning_key,
            &RegisterRequest {
                uuid: identity.uuid.clone(),
                device_name: identity.device_name.clone(),
                device_type: identity.device_type.clone(),
                device_api_key: identity.device_api_key.clone(),
                application_id: identity.application_id,
                mac_address: identity.mac_address.clone(),
                os_version: identity.os_version.clone(),
                agent_version: identity.agent_version.clone(),
            },
        )
        .await?;

    if let Some(mqtt) = &response.mqtt {
        identity.mqtt_broker_url = Some(mqtt.broker.clone());
        identity.mqtt_username = Some(mqtt.username.clone());
        identity.mqtt_password = Some(mqtt.password.clone());
    }

    // Phase 3: confirm the device key under its own authority.
    client.key_exchange(&identity.device_api_key, &identity.uuid).await?;

    // Phase 4: flip to provisioned, dropping the one-time key in the same
    // persisted write.
    identity.mark_provisioned(response.id.to_string(), Utc::now());
    store.save_identity(&identity).await?;
    info!(uuid = %identity.uuid, device_id = %response.id, "device provisioned");
    Ok(identity)
}

/// Retry [`ensure_provisioned`] with offline backoff until it succeeds or
/// the agent shuts down. An `ApplicationMismatch` is terminal.
pub async fn run_provisioning_loop(
    store: &Arc<dyn DeviceStore>,
    settings: &ProvisionSettings,
    cancel: &CancellationToken,
) -> Result<Option<DeviceIdentity>, CloudError> {
    let mut backoff = Backoff::offline();
    loop {
        match ensure_provisioned(store, settings).await {
            Ok(identity) => return Ok(Some(identity)),
            Err(e @ CloudError::ApplicationMismatch { .. }) => return Err(e),
            Err(e) => {
                let delay = backoff.next();
                warn!(error = %e, retry_in = ?delay, "provisioning failed");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
