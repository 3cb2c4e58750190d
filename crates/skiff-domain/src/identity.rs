use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Generate a permanent device API key: 32 random bytes, hex-encoded.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The persisted identity of this device.
///
/// Created once at first boot and kept for the lifetime of the device; a
/// factory reset preserves `uuid` and `device_api_key` and clears the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Immutable, generated locally at first boot.
    pub uuid: String,
    /// Assigned by the cloud on registration.
    pub device_id: Option<String>,
    pub device_name: String,
    pub device_type: String,
    /// Permanent device secret, generated locally.
    pub device_api_key: String,
    /// Temporary fleet secret. Present only between first boot and a
    /// successful key exchange; cleared afterwards.
    pub provisioning_api_key: Option<String>,
    pub api_endpoint: Option<String>,
    pub application_id: Option<i64>,
    pub mac_address: Option<String>,
    pub os_version: Option<String>,
    pub agent_version: Option<String>,
    pub provisioned: bool,
    pub registered_at: Option<DateTime<Utc>>,
    pub mqtt_broker_url: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
}

impl DeviceIdentity {
    /// Create a fresh identity with a v4 uuid and a generated device key.
    pub fn bootstrap(device_name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            device_id: None,
            device_name: device_name.into(),
            device_type: device_type.into(),
            device_api_key: generate_api_key(),
            provisioning_api_key: None,
            api_endpoint: None,
            application_id: None,
            mac_address: None,
            os_version: None,
            agent_version: None,
            provisioned: false,
            registered_at: None,
            mqtt_broker_url: None,
            mqtt_username: None,
            mqtt_password: None,
        }
    }

    /// Transition to provisioned after a successful key exchange.
    ///
    /// Clears the one-time provisioning key in the same step so the
    /// invariant `provisioned ⇒ provisioning_api_key absent` can never be
    /// observed broken.
    pub fn mark_provisioned(&mut self, device_id: String, now: DateTime<Utc>) {
        self.device_id = Some(device_id);
        self.provisioning_api_key = None;
        self.provisioned = true;
        self.registered_at = Some(now);
    }

    /// Check the provisioning invariant; returns an error describing the
    /// violation if the record is inconsistent.
    pub fn check_invariant(&self) -> Result<(), DomainError> {
        if self.provisioned {
            if self.provisioning_api_key.is_some() {
                return Err(DomainError::IdentityInvariant(
                    "provisioned device still holds a provisioning key".into(),
                ));
            }
            if self.device_api_key.is_empty() {
                return Err(DomainError::IdentityInvariant(
                    "provisioned device has an empty device key".into(),
                ));
            }
        }
        Ok(())
    }

    /// Factory reset: keep `uuid` and `device_api_key`, clear everything the
    /// cloud assigned.
    pub fn reset(&mut self) {
        self.device_id = None;
        self.provisioning_api_key = None;
        self.application_id = None;
        self.provisioned = false;
        self.registered_at = None;
        self.mqtt_broker_url = None;
        self.mqtt_username = None;
        self.mqtt_password = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_64_hex_chars() {
        let key = generate_api_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn mark_provisioned_clears_provisioning_key() {
        let mut id = DeviceIdentity::bootstrap("dev", "generic");
        id.provisioning_api_key = Some("pk_test".into());
        id.mark_provisioned("42".into(), Utc::now());

        assert!(id.provisioned);
        assert_eq!(id.device_id.as_deref(), Some("42"));
        assert!(id.provisioning_api_key.is_none());
        assert!(id.check_invariant().is_ok());
    }

    #[test]
    fn invariant_rejects_lingering_provisioning_key() {
        let mut id = DeviceIdentity::bootstrap("dev", "generic");
        id.provisioned = true;
        id.provisioning_api_key = Some("pk_test".into());
        assert!(id.check_invariant().is_err());
    }

    #[test]
    fn reset_preserves_uuid_and_device_key() {
        let mut id = DeviceIdentity::bootstrap("dev", "generic");
        let uuid = id.uuid.clone();
        let key = id.device_api_key.clone();
        id.mark_provisioned("42".into(), Utc::now());

        id.reset();
        assert_eq!(id.uuid, uuid);
        assert_eq!(id.device_api_key, key);
        assert!(!id.provisioned);
        assert!(id.device_id.is_none());
    }
}
