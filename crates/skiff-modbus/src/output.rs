use std::path::Path;

use skiff_domain::{OutputConfig, Sample};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AdapterError;

const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Encodes sample batches into delimiter-separated frames and fans them out
/// to every connected IPC consumer.
#[derive(Clone)]
pub struct SampleWriter {
    config: OutputConfig,
    tx: broadcast::Sender<Vec<u8>>,
}

impl SampleWriter {
    pub fn new(config: OutputConfig) -> Self {
        let (tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self { config, tx }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.tx.subscribe()
    }

    /// One frame per sample: JSON payload followed by the configured
    /// delimiter. Field inclusion follows the output row.
    pub fn encode_batch(&self, samples: &[Sample]) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::new();
        for sample in samples {
            let mut value = serde_json::to_value(sample)?;
            if let Some(map) = value.as_object_mut() {
                if !self.config.include_timestamp {
                    map.remove("timestamp");
                }
                if !self.config.include_device_name {
                    map.remove("device_name");
                }
            }
            out.extend_from_slice(serde_json::to_string(&value)?.as_bytes());
            out.extend_from_slice(self.config.delimiter.as_bytes());
        }
        Ok(out)
    }

    /// Flush a whole poll's samples as one batch. Publishing with no
    /// connected consumers is not an error.
    pub fn send_batch(&self, samples: &[Sample]) {
        if samples.is_empty() {
            return;
        }
        match self.encode_batch(samples) {
            Ok(frame) => {
                let _ = self.tx.send(frame);
            }
            Err(e) => warn!(error = %e, "failed to encode sample batch"),
        }
    }
}

/// Unix-socket server publishing the adapter's sample stream.
pub struct OutputServer {
    writer: SampleWriter,
}

impl OutputServer {
    /// Bind the socket at the configured path (replacing any stale file) and
    /// start accepting consumers.
    pub fn bind(config: OutputConfig, cancel: CancellationToken) -> Result<Self, AdapterError> {
        let path = Path::new(&config.socket_path).to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "adapter output socket bound");

        let writer = SampleWriter::new(config);
        let accept_writer = writer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = std::fs::remove_file(&path);
                        return;
                    }
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "accept failed on output socket");
                                continue;
                            }
                        };
                        debug!("output consumer connected");
                        let mut rx = accept_writer.subscribe();
                        let child_cancel = cancel.clone();
                        tokio::spawn(async move {
                            let mut stream = stream;
                            loop {
                                tokio::select! {
                                    _ = child_cancel.cancelled() => return,
                                    frame = rx.recv() => match frame {
                                        Ok(frame) => {
                                            if stream.write_all(&frame).await.is_err() {
                                                debug!("output consumer disconnected");
                                                return;
                                            }
                                        }
                                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                            warn!(skipped, "output consumer lagging, frames dropped");
                                        }
                                        Err(broadcast::error::RecvError::Closed) => return,
                                    }
                                }
                            }
                        });
                    }
                }
            }
        });

        Ok(Self { writer })
    }

    pub fn writer(&self) -> SampleWriter {
        self.writer.clone()
    }
}
