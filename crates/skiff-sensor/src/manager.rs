use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::publisher::MessagePublisher;
use crate::sensor::{Sensor, SensorState, SensorStats};

pub const MAX_SENSORS: usize = 10;

/// Owns every configured [`Sensor`] and applies config changes as a set.
///
/// Unlike the adapter rows, sensor config is all-or-nothing: any invalid
/// entry refuses the whole update and leaves the running set untouched.
pub struct SensorManager {
    device_uuid: String,
    publisher: Arc<dyn MessagePublisher>,
    cancel: CancellationToken,
    sensors: Mutex<HashMap<String, Sensor>>,
}

impl SensorManager {
    pub fn new(
        device_uuid: impl Into<String>,
        publisher: Arc<dyn MessagePublisher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device_uuid: device_uuid.into(),
            publisher,
            cancel,
            sensors: Mutex::new(HashMap::new()),
        }
    }

    fn validate_set(configs: &[SensorConfig]) -> Result<(), SensorError> {
        if configs.len() > MAX_SENSORS {
            return Err(SensorError::TooManySensors(configs.len()));
        }
        let mut seen = HashSet::new();
        for config in configs {
            config.validate()?;
            if !seen.insert(config.name.as_str()) {
                return Err(SensorError::DuplicateName(config.name.clone()));
            }
        }
        Ok(())
    }

    /// Replace the sensor set. Unchanged sensors keep running (and keep
    /// their stats); removed ones stop; new or changed ones (re)start.
    pub async fn apply(&self, configs: Vec<SensorConfig>) -> Result<(), SensorError> {
        Self::validate_set(&configs)?;

        let incoming: HashSet<String> = configs.iter().map(|c| c.name.clone()).collect();
        let mut sensors = self.sensors.lock().await;

        let stale: Vec<String> = sensors
            .keys()
            .filter(|name| !incoming.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(sensor) = sensors.remove(&name) {
                info!(sensor = %name, "stopping removed sensor");
                sensor.shutdown().await;
            }
        }

        for config in configs {
            let unchanged = sensors.get(&config.name).map_or(false, |s| s.config() == &config);
            if unchanged {
                continue;
            }
            if let Some(sensor) = sensors.remove(&config.name) {
                info!(sensor = %config.name, "restarting sensor with new config");
                sensor.shutdown().await;
            }
            let name = config.name.clone();
            let sensor = Sensor::spawn(
                config,
                self.device_uuid.clone(),
                self.publisher.clone(),
                &self.cancel,
            )?;
            sensors.insert(name, sensor);
        }
        Ok(())
    }

    /// Current state and stats per sensor, for the stats surface.
    pub async fn status(&self) -> HashMap<String, (SensorState, SensorStats)> {
        let sensors = self.sensors.lock().await;
        let mut out = HashMap::with_capacity(sensors.len());
        for (name, sensor) in sensors.iter() {
            out.insert(name.clone(), (sensor.state(), sensor.stats().await));
        }
        out
    }

    pub async fn shutdown(&self) {
        let mut sensors = self.sensors.lock().await;
        for (_, sensor) in sensors.drain() {
            sensor.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::publisher::PublishQos;

    struct NullPublisher;

    #[async_trait]
    impl MessagePublisher for NullPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
            _qos: PublishQos,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            false
        }
    }

    fn config(name: &str) -> SensorConfig {
        SensorConfig {
            name: name.into(),
            addr: format!("/tmp/skiff-test-{}.sock", name),
            eom_delimiter: r"\n".into(),
            mqtt_topic: name.into(),
            buffer_size: 10,
            buffer_time_ms: 100,
            buffer_capacity: 4_096,
            heartbeat_topic: None,
            heartbeat_interval_s: 30,
            addr_poll_sec: 60,
        }
    }

    fn manager() -> SensorManager {
        SensorManager::new("uuid-1", Arc::new(NullPublisher), CancellationToken::new())
    }

    #[tokio::test]
    async fn apply_starts_and_stops_sensors() {
        let m = manager();
        m.apply(vec![config("a"), config("b")]).await.unwrap();
        assert_eq!(m.status().await.len(), 2);

        m.apply(vec![config("a")]).await.unwrap();
        let status = m.status().await;
        assert!(status.contains_key("a"));
        assert!(!status.contains_key("b"));
        m.shutdown().await;
    }

    #[tokio::test]
    async fn more_than_ten_sensors_refused() {
        let m = manager();
        let configs: Vec<SensorConfig> =
            (0..11).map(|i| config(&format!("s{}", i))).collect();
        assert!(matches!(
            m.apply(configs).await,
            Err(SensorError::TooManySensors(11))
        ));
        assert!(m.status().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_names_refused() {
        let m = manager();
        assert!(matches!(
            m.apply(vec![config("a"), config("a")]).await,
            Err(SensorError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn invalid_entry_leaves_running_set_untouched() {
        let m = manager();
        m.apply(vec![config("a")]).await.unwrap();

        let mut bad = config("b");
        bad.eom_delimiter = "[broken".into();
        assert!(m.apply(vec![config("a"), bad]).await.is_err());

        // "a" is still there, "b" never started.
        let status = m.status().await;
        assert_eq!(status.len(), 1);
        assert!(status.contains_key("a"));
        m.shutdown().await;
    }
}
