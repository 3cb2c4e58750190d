use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skiff_domain::TargetDocument;
use skiff_store::{compute_state_hash, DeviceStore, SnapshotKind};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::client::{CloudClient, TargetFetch};
use crate::error::CloudError;

/// Receives every changed target document from the poll loop (the config
/// distributor and the reconciliation engine sit behind this seam).
#[async_trait]
pub trait TargetHandler: Send + Sync + 'static {
    async fn handle_target(&self, document: TargetDocument);
}

/// Produces the current-state report body:
/// `{ "<uuid>": { apps, cpu_usage, …, is_online: true } }`.
#[async_trait]
pub trait ReportSource: Send + Sync + 'static {
    async fn current_report(&self) -> serde_json::Value;
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub report_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            report_interval: Duration::from_secs(30),
        }
    }
}

/// The cloud sync pair: ETag-conditional target polling and hash-gated
/// current-state reporting, both offline-tolerant.
pub struct CloudSync {
    client: CloudClient,
    store: Arc<dyn DeviceStore>,
    uuid: String,
    device_key: String,
    settings: SyncSettings,
    etag: RwLock<Option<String>>,
    last_report_hash: RwLock<Option<String>>,
    last_poll_at: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl CloudSync {
    pub fn new(
        client: CloudClient,
        store: Arc<dyn DeviceStore>,
        uuid: impl Into<String>,
        device_key: impl Into<String>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            client,
            store,
            uuid: uuid.into(),
            device_key: device_key.into(),
            settings,
            etag: RwLock::new(None),
            last_report_hash: RwLock::new(None),
            last_poll_at: Arc::new(RwLock::new(None)),
        }
    }

    /// Shared liveness marker for the local API watchdog; updated on every
    /// poll attempt, successful or not.
    pub fn liveness(&self) -> Arc<RwLock<Option<DateTime<Utc>>>> {
        self.last_poll_at.clone()
    }

    pub async fn poll_once(&self, handler: &Arc<dyn TargetHandler>) -> Result<(), CloudError> {
        *self.last_poll_at.write().await = Some(Utc::now());
        let etag = self.etag.read().await.clone();
        match self
            .client
            .fetch_target(&self.device_key, &self.uuid, etag.as_deref())
            .await?
        {
            TargetFetch::NotModified => Ok(()),
            TargetFetch::Modified { document, etag } => {
                info!(apps = document.apps.len(), "received new target state");
                *self.etag.write().await = etag;
                self.store
                    .save_snapshot(SnapshotKind::Target, &serde_json::to_value(&document)?)
                    .await?;
                handler.handle_target(document).await;
                Ok(())
            }
        }
    }

    /// Poll the cloud for target state until cancelled. Failures back off
    /// (5 s → 5 min); the last known target stays authoritative throughout.
    pub async fn run_poll_loop(
        self: Arc<Self>,
        handler: Arc<dyn TargetHandler>,
        cancel: CancellationToken,
    ) {
        let mut backoff = Backoff::offline();
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("poll loop stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            match self.poll_once(&handler).await {
                Ok(()) => {
                    backoff.reset();
                    delay = self.settings.poll_interval;
                }
                Err(e) => {
                    delay = backoff.next();
                    warn!(error = %e, retry_in = ?delay, "target poll failed");
                }
            }
        }
    }

    pub async fn report_once(&self, source: &Arc<dyn ReportSource>) -> Result<(), CloudError> {
        let report = source.current_report().await;
        let hash = compute_state_hash(&report);
        if self.last_report_hash.read().await.as_deref() == Some(hash.as_str()) {
            debug!("report unchanged, skipping PATCH");
            return Ok(());
        }
        self.client.report_state(&self.device_key, &report).await?;
        *self.last_report_hash.write().await = Some(hash);
        Ok(())
    }

    /// Report current state until cancelled, with the same offline curve as
    /// the poll loop.
    pub async fn run_report_loop(
        self: Arc<Self>,
        source: Arc<dyn ReportSource>,
        cancel: CancellationToken,
    ) {
        let mut backoff = Backoff::offline();
        let mut delay = self.settings.report_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("report loop stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            match self.report_once(&source).await {
                Ok(()) => {
                    backoff.reset();
                    delay = self.settings.report_interval;
                }
                Err(e) => {
                    delay = backoff.next();
                    warn!(error = %e, retry_in = ?delay, "state report failed");
                }
            }
        }
    }
}
