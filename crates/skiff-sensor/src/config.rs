use serde::{Deserialize, Serialize};

use crate::error::SensorError;

pub const MIN_BUFFER_CAPACITY: usize = 1024;

/// One configured sensor: where to read (IPC path), how to frame, how to
/// batch, and where to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    /// Path of the local IPC socket to consume.
    pub addr: String,
    /// End-of-message delimiter, as a regex.
    #[serde(default = "default_delimiter")]
    pub eom_delimiter: String,
    /// Suffix of the telemetry topic: `iot/device/{uuid}/sensor/{mqtt_topic}`.
    pub mqtt_topic: String,
    /// Publish when this many messages are batched. 0 disables the count
    /// trigger.
    #[serde(default)]
    pub buffer_size: usize,
    /// Publish when the oldest batched message is this old. 0 disables the
    /// time trigger. When both triggers are 0, every message publishes alone.
    #[serde(default)]
    pub buffer_time_ms: u64,
    /// Byte capacity of the framing buffer. Must be ≥ 1024.
    #[serde(default = "default_capacity")]
    pub buffer_capacity: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_topic: Option<String>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_s: u64,
    /// Reconnect delay after the socket closes or errors.
    #[serde(default = "default_addr_poll")]
    pub addr_poll_sec: u64,
}

fn default_delimiter() -> String {
    "\n".into()
}

fn default_capacity() -> usize {
    64 * 1024
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_addr_poll() -> u64 {
    10
}

impl SensorConfig {
    pub fn validate(&self) -> Result<(), SensorError> {
        if self.name.is_empty() {
            return Err(SensorError::MissingField { name: "<unnamed>".into(), field: "name" });
        }
        if self.addr.is_empty() {
            return Err(SensorError::MissingField { name: self.name.clone(), field: "addr" });
        }
        if self.mqtt_topic.is_empty() {
            return Err(SensorError::MissingField {
                name: self.name.clone(),
                field: "mqtt_topic",
            });
        }
        if self.buffer_capacity < MIN_BUFFER_CAPACITY {
            return Err(SensorError::CapacityTooSmall {
                name: self.name.clone(),
                capacity: self.buffer_capacity,
            });
        }
        regex::Regex::new(&self.eom_delimiter).map_err(|source| SensorError::InvalidRegex {
            name: self.name.clone(),
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn sample(name: &str) -> SensorConfig {
        SensorConfig {
            name: name.into(),
            addr: "/run/skiff/modbus.sock".into(),
            eom_delimiter: "\r?\n".into(),
            mqtt_topic: "water-quality".into(),
            buffer_size: 100,
            buffer_time_ms: 1_000,
            buffer_capacity: 4_096,
            heartbeat_topic: Some("water-quality-hb".into()),
            heartbeat_interval_s: 30,
            addr_poll_sec: 10,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample("s1").validate().is_ok());
    }

    #[test]
    fn small_capacity_refused() {
        let mut c = sample("s1");
        c.buffer_capacity = 512;
        assert!(matches!(c.validate(), Err(SensorError::CapacityTooSmall { .. })));
    }

    #[test]
    fn bad_regex_refused() {
        let mut c = sample("s1");
        c.eom_delimiter = "[unclosed".into();
        assert!(matches!(c.validate(), Err(SensorError::InvalidRegex { .. })));
    }

    #[test]
    fn missing_topic_refused() {
        let mut c = sample("s1");
        c.mqtt_topic = String::new();
        assert!(matches!(c.validate(), Err(SensorError::MissingField { .. })));
    }

    #[test]
    fn defaults_deserialize() {
        let c: SensorConfig = serde_json::from_str(
            r#"{"name":"s","addr":"/tmp/s.sock","mqtt_topic":"t"}"#,
        )
        .unwrap();
        assert_eq!(c.eom_delimiter, "\n");
        assert_eq!(c.buffer_capacity, 64 * 1024);
        assert_eq!(c.addr_poll_sec, 10);
        assert!(c.heartbeat_topic.is_none());
    }
}
