use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use skiff_domain::{AdapterDevice, DeviceIdentity, OutputConfig, Protocol};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::hash::compute_state_hash;
use crate::store::{DeviceStore, SnapshotKind, StateSnapshot};

#[derive(Debug, Default)]
struct Inner {
    identity: Option<DeviceIdentity>,
    snapshots: HashMap<&'static str, StateSnapshot>,
    adapter_devices: HashMap<String, AdapterDevice>,
    output_configs: HashMap<Protocol, OutputConfig>,
}

/// In-memory implementation of [`DeviceStore`].
///
/// All data is lost on process exit. Suitable for tests and simulation mode.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for InMemoryStore {
    async fn load_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.identity.clone())
    }

    async fn save_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.identity = Some(identity.clone());
        Ok(())
    }

    async fn factory_reset(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(identity) = guard.identity.as_mut() {
            identity.reset();
        }
        guard.snapshots.clear();
        guard.adapter_devices.clear();
        guard.output_configs.clear();
        Ok(())
    }

    async fn load_snapshot(&self, kind: SnapshotKind) -> Result<Option<StateSnapshot>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.snapshots.get(kind.as_str()).cloned())
    }

    async fn save_snapshot(&self, kind: SnapshotKind, state: &Value) -> Result<bool, StoreError> {
        let hash = compute_state_hash(state);
        let mut guard = self.inner.write().await;
        if let Some(existing) = guard.snapshots.get(kind.as_str()) {
            if existing.state_hash == hash {
                return Ok(false);
            }
        }
        guard.snapshots.insert(
            kind.as_str(),
            StateSnapshot {
                kind,
                state: state.clone(),
                state_hash: hash,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn list_adapter_devices(&self) -> Result<Vec<AdapterDevice>, StoreError> {
        let guard = self.inner.read().await;
        let mut devices: Vec<AdapterDevice> = guard.adapter_devices.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }

    async fn upsert_adapter_device(&self, device: &AdapterDevice) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.adapter_devices.insert(device.name.clone(), device.clone());
        Ok(())
    }

    async fn delete_adapter_device(&self, name: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.adapter_devices.remove(name);
        Ok(())
    }

    async fn get_output_config(
        &self,
        protocol: Protocol,
    ) -> Result<Option<OutputConfig>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.output_configs.get(&protocol).cloned())
    }

    async fn upsert_output_config(&self, config: &OutputConfig) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.output_configs.insert(config.protocol, config.clone());
        Ok(())
    }
}
