use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Agent configuration. Every option is also an environment variable, which
/// is how fleet installs set them.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "skiffd",
    about = "Device-fleet edge agent: container reconciliation, field-protocol ingest, MQTT telemetry",
    version
)]
pub struct AgentConfig {
    /// Cloud base URL, e.g. https://cloud.example.com
    #[arg(long, env = "API_ENDPOINT")]
    pub api_endpoint: Option<String>,

    /// One-time fleet key; presence triggers first-time provisioning.
    #[arg(long, env = "PROVISIONING_API_KEY")]
    pub provisioning_api_key: Option<String>,

    /// Broker URL; overridden by cloud-returned credentials after
    /// registration.
    #[arg(long, env = "MQTT_BROKER_URL")]
    pub mqtt_broker_url: Option<String>,

    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    pub mqtt_password: Option<String>,

    /// Drive the real container daemon instead of the simulated runtime.
    #[arg(long, env = "USE_REAL_RUNTIME", default_value_t = false)]
    pub use_real_runtime: bool,

    #[arg(long, env = "AGENT_VERSION")]
    pub agent_version: Option<String>,

    #[arg(long, env = "OS_VERSION")]
    pub os_version: Option<String>,

    #[arg(long, env = "LOCAL_API_PORT", default_value_t = 48484)]
    pub local_api_port: u16,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 30_000)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "REPORT_INTERVAL_MS", default_value_t = 30_000)]
    pub report_interval_ms: u64,

    #[arg(long, env = "DEVICE_NAME", default_value = "skiff-device")]
    pub device_name: String,

    #[arg(long, env = "DEVICE_TYPE", default_value = "generic")]
    pub device_type: String,

    #[arg(long, env = "APPLICATION_ID")]
    pub application_id: Option<i64>,

    #[arg(long, env = "DATABASE_PATH", default_value = "/var/lib/skiff/skiff.db")]
    pub database_path: PathBuf,

    /// Where the protocol-adapter subsystem serves its sample stream.
    #[arg(long, env = "ADAPTER_SOCKET_PATH", default_value = "/run/skiff/modbus.sock")]
    pub adapter_socket_path: String,

    /// Disable local-API authentication (development only).
    #[arg(long, env = "DEV_MODE", default_value_t = false)]
    pub dev_mode: bool,
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1_000))
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(1_000))
    }

    /// The local API watchdog window: four poll intervals, at least 2 min.
    pub fn watchdog_window(&self) -> Duration {
        (self.poll_interval() * 4).max(Duration::from_secs(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        AgentConfig::command().debug_assert();
    }

    #[test]
    fn defaults_apply() {
        let config = AgentConfig::parse_from(["skiffd"]);
        assert_eq!(config.local_api_port, 48484);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert!(!config.use_real_runtime);
    }

    #[test]
    fn intervals_are_floored() {
        let config = AgentConfig::parse_from(["skiffd", "--poll-interval-ms", "10"]);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
