use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use skiff_engine::Reconciler;
use tokio::sync::RwLock;

/// Identity summary exposed on `GET /v1/device`. Secrets never appear here.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub uuid: String,
    pub device_id: Option<String>,
    pub device_name: String,
    pub device_type: String,
    pub os_version: Option<String>,
    pub agent_version: Option<String>,
    pub provisioned: bool,
}

#[derive(Clone)]
pub struct ApiState {
    pub reconciler: Arc<Reconciler>,
    pub device: Arc<DeviceInfo>,
    /// `None` disables auth (dev mode).
    pub api_key: Option<Arc<String>>,
    /// Last cloud-sync poll attempt; `None` when cloud sync is not
    /// configured (local-only mode), which exempts it from the watchdog.
    pub sync_liveness: Option<Arc<RwLock<Option<DateTime<Utc>>>>>,
    pub watchdog_window: Duration,
}

impl ApiState {
    pub fn watchdog_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.watchdog_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(120))
    }
}
