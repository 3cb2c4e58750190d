use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skiff_domain::{AdapterDevice, DeviceIdentity, OutputConfig, Protocol};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Current,
    Target,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Current => "current",
            SnapshotKind::Target => "target",
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted state document. `state` is the raw JSON (a `DeviceState` for
/// current, a `TargetDocument` for target); `state_hash` is its canonical
/// SHA-256.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub kind: SnapshotKind,
    pub state: Value,
    pub state_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence seam for the agent. One implementation is backed by SQLite,
/// one by memory (tests, simulation).
#[async_trait]
pub trait DeviceStore: Send + Sync + 'static {
    // ── Device identity ───────────────────────────────────────────────────────

    async fn load_identity(&self) -> Result<Option<DeviceIdentity>, StoreError>;
    async fn save_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError>;

    /// Explicit reset: preserves `uuid` and `device_api_key` on the identity,
    /// clears cloud-assigned fields, and drops all snapshots and adapter rows.
    async fn factory_reset(&self) -> Result<(), StoreError>;

    // ── State snapshots ───────────────────────────────────────────────────────

    async fn load_snapshot(&self, kind: SnapshotKind) -> Result<Option<StateSnapshot>, StoreError>;

    /// Replace the snapshot of `kind` wholesale — but only when the content
    /// hash actually changed. Returns whether a write happened.
    async fn save_snapshot(&self, kind: SnapshotKind, state: &Value) -> Result<bool, StoreError>;

    // ── Protocol adapter rows ─────────────────────────────────────────────────

    async fn list_adapter_devices(&self) -> Result<Vec<AdapterDevice>, StoreError>;
    async fn upsert_adapter_device(&self, device: &AdapterDevice) -> Result<(), StoreError>;
    async fn delete_adapter_device(&self, name: &str) -> Result<(), StoreError>;

    async fn get_output_config(
        &self,
        protocol: Protocol,
    ) -> Result<Option<OutputConfig>, StoreError>;
    async fn upsert_output_config(&self, config: &OutputConfig) -> Result<(), StoreError>;
}
