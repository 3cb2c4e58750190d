use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use skiff_domain::{AdapterDevice, QualityCode, Sample};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decode::{decode_bits, decode_registers};
use crate::output::SampleWriter;
use crate::transport::{Connector, RegisterSource};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Read every configured data point once. Returns the samples plus whether a
/// fatal transport error occurred (connection must be torn down).
///
/// Reads run strictly sequentially: one in-flight request per client.
pub async fn poll_device(
    source: &mut dyn RegisterSource,
    device: &AdapterDevice,
) -> (Vec<Sample>, bool) {
    let mut samples = Vec::with_capacity(device.data_points.len());
    let mut fatal = false;

    for dp in &device.data_points {
        let now = Utc::now();
        if fatal {
            // The link already died this tick; remaining points are offline.
            samples.push(Sample::bad(
                &device.name,
                &dp.name,
                dp.unit.clone(),
                now,
                QualityCode::DeviceOffline,
            ));
            continue;
        }

        let outcome = if dp.function_code.is_bit_read() {
            source
                .read_bits(dp.function_code, dp.address, dp.count)
                .await
                .map(|bits| Some(decode_bits(&bits)))
        } else {
            source
                .read_registers(dp.function_code, dp.address, dp.count)
                .await
                .map(|words| decode_registers(dp, &words))
        };

        match outcome {
            Ok(Some(value)) => {
                samples.push(Sample::good(&device.name, &dp.name, value, dp.unit.clone(), now));
            }
            Ok(None) => {
                warn!(device = %device.name, point = %dp.name, "short register read");
                samples.push(Sample::bad(
                    &device.name,
                    &dp.name,
                    dp.unit.clone(),
                    now,
                    QualityCode::ReadError,
                ));
            }
            Err(e) => {
                warn!(device = %device.name, point = %dp.name, error = %e, "read failed");
                if e.is_fatal() {
                    fatal = true;
                }
                samples.push(Sample::bad(
                    &device.name,
                    &dp.name,
                    dp.unit.clone(),
                    now,
                    e.quality_code(),
                ));
            }
        }
    }
    (samples, fatal)
}

/// One BAD sample per configured data point, for ticks where the device has
/// no usable connection.
pub fn offline_samples(device: &AdapterDevice, code: QualityCode) -> Vec<Sample> {
    let now = Utc::now();
    device
        .data_points
        .iter()
        .map(|dp| Sample::bad(&device.name, &dp.name, dp.unit.clone(), now, code))
        .collect()
}

/// Per-device polling task. Owns the connection lifecycle:
/// `DISCONNECTED → CONNECTING → CONNECTED → (ERROR →) DISCONNECTED`, with
/// reconnect attempts spaced by `retry_delay`.
pub struct DeviceClient {
    device: AdapterDevice,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl DeviceClient {
    pub fn spawn(
        device: AdapterDevice,
        connector: Arc<dyn Connector>,
        writer: SampleWriter,
        parent: &CancellationToken,
        retry_delay: Duration,
    ) -> Self {
        let cancel = parent.child_token();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let run_device = device.clone();
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            run(run_device, connector, writer, run_cancel, retry_delay, state_tx).await;
        });
        Self { device, cancel, task, state_rx }
    }

    pub fn device(&self) -> &AdapterDevice {
        &self.device
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Stop polling and close the connection. Serializes with the poll loop:
    /// returns only after the task has exited.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run(
    device: AdapterDevice,
    connector: Arc<dyn Connector>,
    writer: SampleWriter,
    cancel: CancellationToken,
    retry_delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut source: Option<Box<dyn RegisterSource>> = None;
    let mut retry_at = Instant::now();
    let mut ticker = interval(Duration::from_millis(device.poll_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(device = %device.name, interval_ms = device.poll_interval_ms, "adapter client started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(mut s) = source.take() {
                    s.close().await;
                }
                let _ = state_tx.send(ConnectionState::Disconnected);
                debug!(device = %device.name, "adapter client stopped");
                return;
            }
            _ = ticker.tick() => {
                let mut connect_failure: Option<QualityCode> = None;
                if source.is_none() && Instant::now() >= retry_at {
                    let _ = state_tx.send(ConnectionState::Connecting);
                    match connector.connect(&device.connection).await {
                        Ok(s) => {
                            info!(device = %device.name, "adapter connected");
                            source = Some(s);
                            let _ = state_tx.send(ConnectionState::Connected);
                        }
                        Err(e) => {
                            warn!(device = %device.name, error = %e, "connect failed");
                            connect_failure = Some(e.quality_code());
                            retry_at = Instant::now() + retry_delay;
                            let _ = state_tx.send(ConnectionState::Disconnected);
                        }
                    }
                }

                let samples = match source.as_mut() {
                    Some(s) => {
                        let (samples, fatal) = poll_device(s.as_mut(), &device).await;
                        if fatal {
                            let mut dead = source.take().unwrap();
                            dead.close().await;
                            retry_at = Instant::now() + retry_delay;
                            let _ = state_tx.send(ConnectionState::Error);
                        }
                        samples
                    }
                    None => offline_samples(
                        &device,
                        connect_failure.unwrap_or(QualityCode::DeviceOffline),
                    ),
                };
                writer.send_batch(&samples);
            }
        }
    }
}
