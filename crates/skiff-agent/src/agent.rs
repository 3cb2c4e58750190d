use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use skiff_api::{build_router, ApiState, DeviceInfo};
use skiff_cloud::{
    run_provisioning_loop, CloudClient, CloudSync, ProvisionSettings, ReportSource,
    SyncSettings, TargetHandler,
};
use skiff_domain::{DeviceIdentity, OutputConfig, Protocol, TargetDocument};
use skiff_engine::Reconciler;
use skiff_metrics::{MetricsCollector, MetricsSnapshot};
use skiff_modbus::{AdapterManager, ModbusConnector, OutputServer};
use skiff_mqtt::{ConnectOptions, MqttClient};
use skiff_runtime::{ContainerRuntime, DockerRuntime, SimulatedRuntime};
use skiff_sensor::{MessagePublisher, SensorManager};
use skiff_store::{DeviceStore, SnapshotKind, SqliteStore};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::AgentConfig;
use crate::distributor::ConfigDistributor;
use crate::handlers::{AdapterDevicesHandler, LoggingHandler, SensorsHandler};
use crate::publisher::MqttPublisher;
use crate::shadow::ShadowReporter;

const METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Applies every new target document: apps go to the reconciler, the config
/// blob fans out through the distributor, and the shadow reports the result.
struct TargetApplier {
    reconciler: Arc<Reconciler>,
    distributor: Arc<ConfigDistributor>,
    shadow: Arc<ShadowReporter>,
}

#[async_trait]
impl TargetHandler for TargetApplier {
    async fn handle_target(&self, document: TargetDocument) {
        self.reconciler.set_target(document.state()).await;
        match self.reconciler.reconcile().await {
            Ok(Some(report)) if report.errors.is_empty() => {
                if let Ok(current) = self.reconciler.current_state().await {
                    self.shadow.report(&current).await;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "reconcile after target update failed"),
        }
        self.distributor.dispatch(&document.config).await;
    }
}

/// Builds the PATCH body: current apps plus the latest metrics snapshot.
struct ReportBuilder {
    uuid: String,
    reconciler: Arc<Reconciler>,
    metrics: watch::Receiver<MetricsSnapshot>,
}

#[async_trait]
impl ReportSource for ReportBuilder {
    async fn current_report(&self) -> serde_json::Value {
        let apps = match self.reconciler.current_state().await {
            Ok(state) => serde_json::to_value(&state.apps).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "failed to read current state for report");
                json!({})
            }
        };
        let m = self.metrics.borrow().clone();
        let mut body = serde_json::Map::new();
        body.insert(
            self.uuid.clone(),
            json!({
                "apps": apps,
                "cpu_usage": m.cpu_usage,
                "memory_usage": m.memory_usage,
                "memory_total": m.memory_total,
                "storage_usage": m.storage_usage,
                "storage_total": m.storage_total,
                "temperature": m.temperature,
                "uptime": m.uptime_secs,
                "is_online": true,
            }),
        );
        serde_json::Value::Object(body)
    }
}

pub async fn run(
    config: AgentConfig,
    log_reload: reload::Handle<EnvFilter, Registry>,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let store: Arc<dyn DeviceStore> = Arc::new(
        SqliteStore::open(&config.database_path)
            .await
            .context("opening device database")?,
    );

    let mut metrics = MetricsCollector::new();
    let mac_address = metrics.primary_mac_address();

    // ── Provisioning ──────────────────────────────────────────────────────────
    let settings = ProvisionSettings {
        api_endpoint: config.api_endpoint.clone(),
        provisioning_api_key: config.provisioning_api_key.clone(),
        device_name: config.device_name.clone(),
        device_type: config.device_type.clone(),
        application_id: config.application_id,
        mac_address,
        os_version: config.os_version.clone(),
        agent_version: config
            .agent_version
            .clone()
            .or_else(|| Some(env!("CARGO_PKG_VERSION").to_string())),
    };
    let Some(identity) = run_provisioning_loop(&store, &settings, &cancel)
        .await
        .context("provisioning")?
    else {
        return Ok(()); // cancelled during provisioning
    };

    // ── Runtime + reconciler ──────────────────────────────────────────────────
    let runtime: Arc<dyn ContainerRuntime> = if config.use_real_runtime {
        Arc::new(DockerRuntime::connect().context("connecting to container daemon")?)
    } else {
        info!("running against the simulated container runtime");
        Arc::new(SimulatedRuntime::new())
    };
    let reconciler = Arc::new(Reconciler::new(runtime, store.clone()));

    // ── MQTT ──────────────────────────────────────────────────────────────────
    let mqtt = MqttClient::new();
    let broker = identity
        .mqtt_broker_url
        .clone()
        .or_else(|| config.mqtt_broker_url.clone());
    if let Some(broker) = &broker {
        let mut options = ConnectOptions::new(format!("skiff-{}", identity.uuid));
        let username = identity.mqtt_username.clone().or_else(|| config.mqtt_username.clone());
        let password = identity.mqtt_password.clone().or_else(|| config.mqtt_password.clone());
        if let (Some(username), Some(password)) = (username, password) {
            options = options.credentials(username, password);
        }
        // A timeout here is not fatal: the event loop keeps reconnecting.
        if let Err(e) = mqtt.connect(broker, options).await {
            warn!(broker = %broker, error = %e, "mqtt connect pending");
        }
    } else {
        info!("no mqtt broker configured, telemetry publishing disabled");
    }

    // ── Protocol adapter subsystem ────────────────────────────────────────────
    let output_config = match store.get_output_config(Protocol::Modbus).await? {
        Some(existing) => existing,
        None => {
            let default =
                OutputConfig::for_protocol(Protocol::Modbus, &config.adapter_socket_path);
            store.upsert_output_config(&default).await?;
            default
        }
    };
    let output_server = OutputServer::bind(output_config, cancel.child_token())
        .context("binding adapter output socket")?;
    let adapter_manager = Arc::new(AdapterManager::new(
        store.clone(),
        Arc::new(ModbusConnector::new()),
        output_server.writer(),
        cancel.child_token(),
    ));
    adapter_manager.start_from_store().await?;

    // ── Sensor-publish subsystem ──────────────────────────────────────────────
    let publisher: Arc<dyn MessagePublisher> =
        Arc::new(MqttPublisher { client: mqtt.clone() });
    let sensor_manager = Arc::new(SensorManager::new(
        identity.uuid.clone(),
        publisher,
        cancel.child_token(),
    ));

    // ── Config distributor ────────────────────────────────────────────────────
    let mut distributor = ConfigDistributor::new();
    distributor.register("logging", Arc::new(LoggingHandler { reload: log_reload }));
    distributor.register("sensors", Arc::new(SensorsHandler { manager: sensor_manager.clone() }));
    distributor.register(
        "protocolAdapterDevices",
        Arc::new(AdapterDevicesHandler { manager: adapter_manager.clone() }),
    );
    let distributor = Arc::new(distributor);

    // ── Shadow ────────────────────────────────────────────────────────────────
    let shadow = ShadowReporter::new(mqtt.clone(), identity.uuid.clone());
    if let Err(e) = shadow.subscribe_delta().await {
        warn!(error = %e, "shadow delta subscription failed");
    }

    // ── Boot from the last persisted target ───────────────────────────────────
    if let Some(snapshot) = store.load_snapshot(SnapshotKind::Target).await? {
        match serde_json::from_value::<TargetDocument>(snapshot.state) {
            Ok(document) => {
                info!(apps = document.apps.len(), "restored persisted target state");
                reconciler.set_target(document.state()).await;
                distributor.dispatch(&document.config).await;
            }
            Err(e) => warn!(error = %e, "persisted target snapshot unreadable, ignoring"),
        }
    }

    // ── Metrics loop ──────────────────────────────────────────────────────────
    let (metrics_tx, metrics_rx) = watch::channel(metrics.collect());
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let _ = metrics_tx.send(metrics.collect());
                    }
                }
            }
        });
    }

    // ── Cloud sync ────────────────────────────────────────────────────────────
    let applier: Arc<dyn TargetHandler> = Arc::new(TargetApplier {
        reconciler: reconciler.clone(),
        distributor: distributor.clone(),
        shadow: shadow.clone(),
    });

    let mut sync_liveness = None;
    if identity.provisioned {
        if let Some(endpoint) = identity.api_endpoint.clone().or(config.api_endpoint.clone()) {
            let client = CloudClient::new(&endpoint).context("building cloud client")?;
            let sync = Arc::new(CloudSync::new(
                client,
                store.clone(),
                identity.uuid.clone(),
                identity.device_api_key.clone(),
                SyncSettings {
                    poll_interval: config.poll_interval(),
                    report_interval: config.report_interval(),
                },
            ));
            sync_liveness = Some(sync.liveness());

            tokio::spawn(sync.clone().run_poll_loop(applier.clone(), cancel.child_token()));

            let source: Arc<dyn ReportSource> = Arc::new(ReportBuilder {
                uuid: identity.uuid.clone(),
                reconciler: reconciler.clone(),
                metrics: metrics_rx.clone(),
            });
            tokio::spawn(sync.run_report_loop(source, cancel.child_token()));
        }
    } else {
        info!("device not provisioned, cloud sync disabled");
    }

    // ── Reconcile ticker ──────────────────────────────────────────────────────
    {
        let reconciler = reconciler.clone();
        let shadow = shadow.clone();
        let cancel = cancel.clone();
        let interval = config.poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => match reconciler.reconcile().await {
                        Ok(Some(report)) if !report.skipped && report.errors.is_empty() => {
                            if let Ok(current) = reconciler.current_state().await {
                                shadow.report(&current).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "periodic reconcile failed"),
                    }
                }
            }
        });
    }

    // ── Local device API ──────────────────────────────────────────────────────
    let api_state = ApiState {
        reconciler: reconciler.clone(),
        device: Arc::new(device_info(&identity, &config)),
        api_key: (!config.dev_mode).then(|| Arc::new(identity.device_api_key.clone())),
        sync_liveness,
        watchdog_window: config.watchdog_window(),
    };
    {
        let router = build_router(api_state);
        let port = config.local_api_port;
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = skiff_api::serve(router, port, cancel).await {
                warn!(error = %e, "local API server exited");
            }
        });
    }

    info!(uuid = %identity.uuid, "agent running");
    cancel.cancelled().await;

    // Cooperative shutdown: joins every subsystem's in-flight work.
    sensor_manager.shutdown().await;
    adapter_manager.shutdown().await;
    if let Err(e) = mqtt.disconnect().await {
        warn!(error = %e, "mqtt disconnect failed");
    }
    info!("agent stopped");
    Ok(())
}

fn device_info(identity: &DeviceIdentity, config: &AgentConfig) -> DeviceInfo {
    DeviceInfo {
        uuid: identity.uuid.clone(),
        device_id: identity.device_id.clone(),
        device_name: identity.device_name.clone(),
        device_type: identity.device_type.clone(),
        os_version: identity.os_version.clone().or_else(|| config.os_version.clone()),
        agent_version: identity
            .agent_version
            .clone()
            .or_else(|| Some(env!("CARGO_PKG_VERSION").to_string())),
        provisioned: identity.provisioned,
    }
}
