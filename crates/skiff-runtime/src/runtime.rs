use async_trait::async_trait;
use skiff_domain::{AppId, Service, ServiceConfig, ServiceId, ServiceStatus};

use crate::error::RuntimeError;

/// Containers carrying this label (= "true") are owned by the agent.
/// Anything without it is never inspected or mutated.
pub const MANAGED_LABEL: &str = "io.skiff.managed";
pub const APP_ID_LABEL: &str = "io.skiff.app-id";
pub const APP_NAME_LABEL: &str = "io.skiff.app-name";
pub const SERVICE_ID_LABEL: &str = "io.skiff.service-id";
pub const SERVICE_NAME_LABEL: &str = "io.skiff.service-name";
/// Canonical JSON of the [`ServiceConfig`] the container was created from.
/// Lets the planner do exact config comparison without re-deriving config
/// from runtime inspection.
pub const CONFIG_LABEL: &str = "io.skiff.config";

/// A managed container as observed in the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub container_id: String,
    pub app_id: AppId,
    pub app_name: String,
    pub service_id: ServiceId,
    pub service_name: String,
    pub image: String,
    pub status: ServiceStatus,
    pub config: ServiceConfig,
}

/// Abstract container runtime. All operations are idempotent where the
/// underlying runtime allows it; callers may retry on transient failure.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// All containers carrying the managed label set. Never returns
    /// unmanaged containers.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;

    /// Ensure `image` is present locally. Idempotent.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create and start a container for `service`, labelled with the full
    /// managed label set. Returns the new container id.
    async fn start_service(
        &self,
        app_id: AppId,
        app_name: &str,
        service: &Service,
    ) -> Result<String, RuntimeError>;

    /// Graceful stop: SIGTERM, bounded wait, then SIGKILL.
    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Start an existing stopped container.
    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Remove a stopped container.
    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Remove the named volumes, ignoring ones that don't exist.
    async fn remove_volumes(&self, names: &[String]) -> Result<(), RuntimeError>;
}

/// The named volumes referenced by a service config (`name:/path` entries
/// whose source is not an absolute host path).
pub fn named_volumes(config: &ServiceConfig) -> Vec<String> {
    config
        .volumes
        .iter()
        .filter_map(|v| {
            let (name, _) = v.split_once(':')?;
            if name.starts_with('/') {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}
