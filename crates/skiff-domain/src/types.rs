use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AppId(pub i64);

impl AppId {
    pub fn new(id: i64) -> Self {
        AppId(id)
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ServiceId(pub i64);

impl ServiceId {
    pub fn new(id: i64) -> Self {
        ServiceId(id)
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    #[default]
    Always,
    UnlessStopped,
    OnFailure,
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Downloading,
    Installing,
    Running,
    Stopped,
    Exited,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Downloading => write!(f, "downloading"),
            ServiceStatus::Installing => write!(f, "installing"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Exited => write!(f, "exited"),
        }
    }
}

// ── Core structs ──────────────────────────────────────────────────────────────

/// Everything that determines how a service's container is created.
///
/// Two services with equal configs (per [`ServiceConfig::matches`]) never
/// trigger a recreate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    /// Image reference, e.g. `nginx:1.25`.
    pub image: String,
    /// Port mappings as `host:container` strings. Order-insensitive.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Environment map. BTreeMap keeps serialization order stable.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Volume mounts as `name:/container/path` strings. Order-sensitive.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
}

impl ServiceConfig {
    /// Deep equality over the fields that require a container recreate when
    /// changed: image, environment (order-insensitive), ports (set),
    /// volumes (ordered), restart policy, privileged, network mode.
    pub fn matches(&self, other: &ServiceConfig) -> bool {
        let mut a = self.ports.clone();
        let mut b = other.ports.clone();
        a.sort();
        b.sort();
        self.image == other.image
            && a == b
            && self.environment == other.environment
            && self.volumes == other.volumes
            && self.restart == other.restart
            && self.privileged == other.privileged
            && self.network_mode == other.network_mode
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub service_id: ServiceId,
    pub service_name: String,
    pub image_name: String,
    pub config: ServiceConfig,
    /// Observed status — present only in current state, never in target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
    /// Runtime container id — present only in current state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl Service {
    pub fn new(
        service_id: ServiceId,
        service_name: impl Into<String>,
        image_name: impl Into<String>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            service_id,
            service_name: service_name.into(),
            image_name: image_name.into(),
            config,
            status: None,
            container_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub app_id: AppId,
    pub app_name: String,
    pub services: Vec<Service>,
}

impl App {
    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.iter().find(|s| s.service_id == id)
    }
}

/// A full device state: `app_id → App`. Used for both current and target;
/// only current state carries per-service `status`/`container_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceState {
    #[serde(default)]
    pub apps: BTreeMap<AppId, App>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(app_id, service_id)` pairs present in this state.
    pub fn service_keys(&self) -> Vec<(AppId, ServiceId)> {
        self.apps
            .iter()
            .flat_map(|(app_id, app)| {
                app.services.iter().map(move |s| (*app_id, s.service_id))
            })
            .collect()
    }

    pub fn service(&self, app_id: AppId, service_id: ServiceId) -> Option<&Service> {
        self.apps.get(&app_id).and_then(|a| a.service(service_id))
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

/// The per-device document the cloud returns from `GET /device/{uuid}/state`.
///
/// `apps` feeds the reconciler; `config` is the feature blob fanned out by
/// the config distributor (`logging`, `sensors`, `protocolAdapterDevices`, …).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TargetDocument {
    #[serde(default)]
    pub apps: BTreeMap<AppId, App>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

impl TargetDocument {
    pub fn state(&self) -> DeviceState {
        DeviceState { apps: self.apps.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(image: &str) -> ServiceConfig {
        ServiceConfig { image: image.into(), ..Default::default() }
    }

    #[test]
    fn config_match_ignores_port_order() {
        let mut a = config("nginx:1.25");
        a.ports = vec!["8080:80".into(), "8443:443".into()];
        let mut b = config("nginx:1.25");
        b.ports = vec!["8443:443".into(), "8080:80".into()];
        assert!(a.matches(&b));
    }

    #[test]
    fn config_match_respects_volume_order() {
        let mut a = config("nginx:1.25");
        a.volumes = vec!["data:/data".into(), "logs:/logs".into()];
        let mut b = config("nginx:1.25");
        b.volumes = vec!["logs:/logs".into(), "data:/data".into()];
        assert!(!a.matches(&b));
    }

    #[test]
    fn config_match_detects_image_change() {
        assert!(!config("nginx:1.24").matches(&config("nginx:1.25")));
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = DeviceState::new();
        state.apps.insert(
            AppId(1),
            App {
                app_id: AppId(1),
                app_name: "web".into(),
                services: vec![Service::new(ServiceId(1), "web", "nginx:1.25", config("nginx:1.25"))],
            },
        );
        let json = serde_json::to_string(&state).unwrap();
        let back: DeviceState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn app_ids_serialize_as_json_object_keys() {
        let mut state = DeviceState::new();
        state.apps.insert(
            AppId(7),
            App { app_id: AppId(7), app_name: "a".into(), services: vec![] },
        );
        let v = serde_json::to_value(&state).unwrap();
        assert!(v["apps"]["7"].is_object());
    }

    #[test]
    fn target_document_tolerates_missing_config() {
        let doc: TargetDocument = serde_json::from_str(r#"{"apps":{}}"#).unwrap();
        assert!(doc.config.is_empty());
    }
}
