use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use skiff_domain::AdapterDevice;
use skiff_modbus::AdapterManager;
use skiff_sensor::{SensorConfig, SensorManager};
use tracing::info;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::distributor::ConfigHandler;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// `protocolAdapterDevices` key: the full adapter device row set.
pub struct AdapterDevicesHandler {
    pub manager: Arc<AdapterManager>,
}

#[async_trait]
impl ConfigHandler for AdapterDevicesHandler {
    async fn handle_change(
        &self,
        _key: &str,
        new_value: Option<&Value>,
        _prev_value: Option<&Value>,
    ) -> HandlerResult {
        let rows: Vec<AdapterDevice> = match new_value {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };
        self.manager.apply_devices(rows).await?;
        Ok(())
    }
}

/// `sensors` key: the full sensor set, applied all-or-nothing.
pub struct SensorsHandler {
    pub manager: Arc<SensorManager>,
}

#[async_trait]
impl ConfigHandler for SensorsHandler {
    async fn handle_change(
        &self,
        _key: &str,
        new_value: Option<&Value>,
        _prev_value: Option<&Value>,
    ) -> HandlerResult {
        let configs: Vec<SensorConfig> = match new_value {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };
        self.manager.apply(configs).await?;
        Ok(())
    }
}

/// `logging` key: `{"level": "<env-filter directive>"}`. Reloads the global
/// filter without restart; key removal restores the default.
pub struct LoggingHandler {
    pub reload: reload::Handle<EnvFilter, Registry>,
}

#[async_trait]
impl ConfigHandler for LoggingHandler {
    async fn handle_change(
        &self,
        _key: &str,
        new_value: Option<&Value>,
        _prev_value: Option<&Value>,
    ) -> HandlerResult {
        let directive = new_value
            .and_then(|v| v.get("level"))
            .and_then(|v| v.as_str())
            .unwrap_or("info");
        let filter = EnvFilter::try_new(directive)?;
        self.reload.reload(filter)?;
        info!(level = directive, "log filter updated from target config");
        Ok(())
    }
}
