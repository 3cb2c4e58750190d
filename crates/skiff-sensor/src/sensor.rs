use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::framing::Framer;
use crate::publisher::{MessagePublisher, PublishQos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensorState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorStats {
    pub messages_received: u64,
    pub messages_published: u64,
    pub batches_published: u64,
    pub publish_failures: u64,
    pub bytes_received: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
    pub last_publish_at: Option<DateTime<Utc>>,
}

/// One sensor: consumes a local IPC socket, frames messages, batches them
/// and publishes to MQTT. Owns its connection lifecycle
/// (`DISCONNECTED → CONNECTING → CONNECTED → (ERROR →) DISCONNECTED`).
pub struct Sensor {
    config: SensorConfig,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state_rx: watch::Receiver<SensorState>,
    stats: Arc<RwLock<SensorStats>>,
}

impl Sensor {
    pub fn spawn(
        config: SensorConfig,
        device_uuid: String,
        publisher: Arc<dyn MessagePublisher>,
        parent: &CancellationToken,
    ) -> Result<Self, SensorError> {
        config.validate()?;
        let cancel = parent.child_token();
        let (state_tx, state_rx) = watch::channel(SensorState::Disconnected);
        let stats = Arc::new(RwLock::new(SensorStats::default()));

        let run_config = config.clone();
        let run_cancel = cancel.clone();
        let run_stats = stats.clone();
        let task = tokio::spawn(async move {
            run(run_config, device_uuid, publisher, run_cancel, state_tx, run_stats).await;
        });

        Ok(Self { config, cancel, task, state_rx, stats })
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn state(&self) -> SensorState {
        *self.state_rx.borrow()
    }

    pub async fn stats(&self) -> SensorStats {
        self.stats.read().await.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

enum Exit {
    Cancelled,
    Disconnected,
}

async fn run(
    config: SensorConfig,
    device_uuid: String,
    publisher: Arc<dyn MessagePublisher>,
    cancel: CancellationToken,
    state_tx: watch::Sender<SensorState>,
    stats: Arc<RwLock<SensorStats>>,
) {
    info!(sensor = %config.name, addr = %config.addr, "sensor started");
    let mut first_attempt = true;
    loop {
        let _ = state_tx.send(SensorState::Connecting);
        match UnixStream::connect(&config.addr).await {
            Ok(stream) => {
                info!(sensor = %config.name, "socket connected");
                if !first_attempt {
                    stats.write().await.reconnects += 1;
                }
                let _ = state_tx.send(SensorState::Connected);
                match read_loop(&config, &device_uuid, publisher.as_ref(), stream, &cancel, &stats)
                    .await
                {
                    Exit::Cancelled => {
                        let _ = state_tx.send(SensorState::Disconnected);
                        return;
                    }
                    Exit::Disconnected => {
                        let _ = state_tx.send(SensorState::Error);
                    }
                }
            }
            Err(e) => {
                debug!(sensor = %config.name, error = %e, "socket connect failed");
                stats.write().await.last_error = Some(e.to_string());
                let _ = state_tx.send(SensorState::Disconnected);
            }
        }
        first_attempt = false;

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = state_tx.send(SensorState::Disconnected);
                return;
            }
            _ = sleep(Duration::from_secs(config.addr_poll_sec)) => {}
        }
    }
}

async fn read_loop(
    config: &SensorConfig,
    device_uuid: &str,
    publisher: &dyn MessagePublisher,
    mut stream: UnixStream,
    cancel: &CancellationToken,
    stats: &Arc<RwLock<SensorStats>>,
) -> Exit {
    // The pattern was validated at spawn; a failure here means the regex
    // crate itself changed behaviour, so bail out of this connection.
    let Ok(mut framer) = Framer::new(&config.eom_delimiter, config.buffer_capacity) else {
        error!(sensor = %config.name, "delimiter regex failed to compile");
        return Exit::Disconnected;
    };

    let mut batch: Vec<String> = Vec::new();
    let mut batch_deadline: Option<Instant> = None;
    let mut heartbeat = interval(Duration::from_secs(config.heartbeat_interval_s.max(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Exit::Cancelled,

            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    warn!(sensor = %config.name, "socket closed by peer");
                    return Exit::Disconnected;
                }
                Ok(n) => {
                    let out = framer.push(&buf[..n]);
                    {
                        let mut s = stats.write().await;
                        s.bytes_received += n as u64;
                        s.messages_received += out.messages.len() as u64;
                        if out.dropped_bytes > 0 {
                            error!(
                                sensor = %config.name,
                                bytes = out.dropped_bytes,
                                "message exceeded buffer capacity, dropped"
                            );
                            s.last_error =
                                Some(format!("oversized message dropped ({} bytes)", out.dropped_bytes));
                        }
                    }

                    if !out.messages.is_empty() {
                        batch.extend(out.messages);
                        if batch_deadline.is_none() && config.buffer_time_ms > 0 {
                            batch_deadline =
                                Some(Instant::now() + Duration::from_millis(config.buffer_time_ms));
                        }
                    }

                    let immediate = config.buffer_size == 0 && config.buffer_time_ms == 0;
                    if out.overflowed || immediate {
                        if out.overflowed {
                            warn!(sensor = %config.name, "framing buffer over capacity, flushing batch");
                        }
                        let all = std::mem::take(&mut batch);
                        publish_messages(config, device_uuid, publisher, all, stats).await;
                        batch_deadline = None;
                    } else {
                        // Full batches publish in buffer_size chunks; the
                        // remainder stays queued for the next trigger.
                        while config.buffer_size > 0 && batch.len() >= config.buffer_size {
                            let chunk: Vec<String> =
                                batch.drain(..config.buffer_size).collect();
                            publish_messages(config, device_uuid, publisher, chunk, stats).await;
                        }
                        if batch.is_empty() {
                            batch_deadline = None;
                        }
                    }
                }
                Err(e) => {
                    warn!(sensor = %config.name, error = %e, "socket read failed");
                    stats.write().await.last_error = Some(e.to_string());
                    return Exit::Disconnected;
                }
            },

            _ = deadline_elapsed(batch_deadline) => {
                let all = std::mem::take(&mut batch);
                publish_messages(config, device_uuid, publisher, all, stats).await;
                batch_deadline = None;
            }

            _ = heartbeat.tick(), if config.heartbeat_topic.is_some() => {
                // Socket is connected here by construction; require MQTT too.
                if publisher.is_connected() {
                    send_heartbeat(config, device_uuid, publisher, stats).await;
                }
            }
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn publish_messages(
    config: &SensorConfig,
    device_uuid: &str,
    publisher: &dyn MessagePublisher,
    messages: Vec<String>,
    stats: &Arc<RwLock<SensorStats>>,
) {
    if messages.is_empty() {
        return;
    }
    let count = messages.len() as u64;
    let payload = serde_json::json!({
        "sensor": config.name,
        "timestamp": Utc::now(),
        "messages": messages,
    });
    let bytes = match serde_json::to_vec(&payload) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(sensor = %config.name, error = %e, "failed to encode batch");
            return;
        }
    };

    let topic = format!("iot/device/{}/sensor/{}", device_uuid, config.mqtt_topic);
    match publisher.publish(&topic, bytes, PublishQos::AtLeastOnce).await {
        Ok(()) => {
            let mut s = stats.write().await;
            s.messages_published += count;
            s.batches_published += 1;
            s.last_publish_at = Some(Utc::now());
        }
        Err(e) => {
            // Batch is dropped; the socket loop must not stall on the broker.
            warn!(sensor = %config.name, error = %e, "batch publish failed, dropping");
            let mut s = stats.write().await;
            s.publish_failures += 1;
            s.last_error = Some(e.to_string());
        }
    }
}

async fn send_heartbeat(
    config: &SensorConfig,
    device_uuid: &str,
    publisher: &dyn MessagePublisher,
    stats: &Arc<RwLock<SensorStats>>,
) {
    let Some(heartbeat_topic) = &config.heartbeat_topic else { return };
    let payload = serde_json::json!({
        "sensor": config.name,
        "timestamp": Utc::now(),
        "state": SensorState::Connected,
        "stats": &*stats.read().await,
    });
    let Ok(bytes) = serde_json::to_vec(&payload) else { return };
    let topic = format!("iot/device/{}/sensor/{}", device_uuid, heartbeat_topic);
    if let Err(e) = publisher.publish(&topic, bytes, PublishQos::AtMostOnce).await {
        debug!(sensor = %config.name, error = %e, "heartbeat publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;
    use tokio::sync::Notify;

    struct FakePublisher {
        published: std::sync::Mutex<Vec<(String, serde_json::Value)>>,
        notify: Notify,
        connected: AtomicBool,
    }

    impl FakePublisher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                published: std::sync::Mutex::new(Vec::new()),
                notify: Notify::new(),
                connected: AtomicBool::new(true),
            })
        }

        async fn wait_for(&self, count: usize) -> Vec<(String, serde_json::Value)> {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                {
                    let published = self.published.lock().unwrap();
                    if published.len() >= count {
                        return published.clone();
                    }
                }
                assert!(Instant::now() < deadline, "publish deadline elapsed");
                let _ = tokio::time::timeout(Duration::from_millis(50), self.notify.notified())
                    .await;
            }
        }
    }

    #[async_trait]
    impl MessagePublisher for FakePublisher {
        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            _qos: PublishQos,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let value: serde_json::Value = serde_json::from_slice(&payload)?;
            self.published.lock().unwrap().push((topic.to_string(), value));
            self.notify.notify_waiters();
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn test_config(addr: &str, buffer_size: usize, buffer_time_ms: u64) -> SensorConfig {
        SensorConfig {
            name: "tank".into(),
            addr: addr.into(),
            eom_delimiter: r"\n".into(),
            mqtt_topic: "levels".into(),
            buffer_size,
            buffer_time_ms,
            buffer_capacity: 4_096,
            heartbeat_topic: None,
            heartbeat_interval_s: 30,
            addr_poll_sec: 1,
        }
    }

    async fn socket_fixture() -> (tempfile::TempDir, String, UnixListener) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensor.sock");
        let addr = path.to_string_lossy().to_string();
        let listener = UnixListener::bind(&path).unwrap();
        (dir, addr, listener)
    }

    #[tokio::test]
    async fn size_trigger_publishes_full_batches() {
        let (_dir, addr, listener) = socket_fixture().await;
        let publisher = FakePublisher::new();
        let cancel = CancellationToken::new();
        let sensor = Sensor::spawn(
            test_config(&addr, 2, 0),
            "uuid-1".into(),
            publisher.clone(),
            &cancel,
        )
        .unwrap();

        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"m1\nm2\nm3\n").await.unwrap();

        let published = publisher.wait_for(1).await;
        let (topic, payload) = &published[0];
        assert_eq!(topic, "iot/device/uuid-1/sensor/levels");
        assert_eq!(payload["sensor"], "tank");
        assert_eq!(payload["messages"], serde_json::json!(["m1", "m2"]));
        assert!(payload["timestamp"].is_string());

        let stats = sensor.stats().await;
        assert_eq!(stats.messages_received, 3);
        assert_eq!(stats.messages_published, 2);

        sensor.shutdown().await;
    }

    #[tokio::test]
    async fn time_trigger_flushes_partial_batch() {
        let (_dir, addr, listener) = socket_fixture().await;
        let publisher = FakePublisher::new();
        let cancel = CancellationToken::new();
        let sensor = Sensor::spawn(
            test_config(&addr, 100, 50),
            "uuid-1".into(),
            publisher.clone(),
            &cancel,
        )
        .unwrap();

        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"only-one\n").await.unwrap();

        let published = publisher.wait_for(1).await;
        assert_eq!(published[0].1["messages"], serde_json::json!(["only-one"]));
        sensor.shutdown().await;
    }

    #[tokio::test]
    async fn immediate_mode_publishes_each_message() {
        let (_dir, addr, listener) = socket_fixture().await;
        let publisher = FakePublisher::new();
        let cancel = CancellationToken::new();
        let sensor = Sensor::spawn(
            test_config(&addr, 0, 0),
            "uuid-1".into(),
            publisher.clone(),
            &cancel,
        )
        .unwrap();

        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"a\nb\n").await.unwrap();

        // Both messages arrive in one read: one batch carries them. A later
        // write publishes separately.
        publisher.wait_for(1).await;
        peer.write_all(b"c\n").await.unwrap();
        let published = publisher.wait_for(2).await;
        assert_eq!(published[1].1["messages"], serde_json::json!(["c"]));
        sensor.shutdown().await;
    }

    #[tokio::test]
    async fn reconnects_after_peer_closes() {
        let (_dir, addr, listener) = socket_fixture().await;
        let publisher = FakePublisher::new();
        let cancel = CancellationToken::new();
        let sensor = Sensor::spawn(
            test_config(&addr, 0, 0),
            "uuid-1".into(),
            publisher.clone(),
            &cancel,
        )
        .unwrap();

        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        // addr_poll_sec = 1: the sensor reconnects and keeps consuming.
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"back\n").await.unwrap();
        let published = publisher.wait_for(1).await;
        assert_eq!(published[0].1["messages"], serde_json::json!(["back"]));
        assert_eq!(sensor.stats().await.reconnects, 1);
        sensor.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_rejects_invalid_config() {
        let publisher = FakePublisher::new();
        let cancel = CancellationToken::new();
        let mut config = test_config("/tmp/none.sock", 0, 0);
        config.buffer_capacity = 100;
        let result = Sensor::spawn(config, "uuid-1".into(), publisher, &cancel);
        assert!(matches!(result, Err(SensorError::CapacityTooSmall { .. })));
    }
}
