use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use skiff_domain::{AppId, Service, ServiceStatus};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, ManagedContainer};

#[derive(Debug, Default)]
struct Inner {
    images: HashSet<String>,
    containers: HashMap<String, ManagedContainer>,
    volumes: HashSet<String>,
}

/// An in-memory container runtime that simulates Docker.
///
/// Used in tests and when `USE_REAL_RUNTIME` is off, so the full agent loop
/// can run on a development machine with no daemon.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRuntime {
    inner: Arc<RwLock<Inner>>,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: whether `image` has been pulled.
    pub async fn has_image(&self, image: &str) -> bool {
        self.inner.read().await.images.contains(image)
    }

    /// Test helper: register a named volume as existing.
    pub async fn add_volume(&self, name: &str) {
        self.inner.write().await.volumes.insert(name.to_string());
    }

    /// Test helper: whether a named volume exists.
    pub async fn has_volume(&self, name: &str) -> bool {
        self.inner.read().await.volumes.contains(name)
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let guard = self.inner.read().await;
        let mut containers: Vec<ManagedContainer> = guard.containers.values().cloned().collect();
        containers.sort_by(|a, b| (a.app_id, a.service_id).cmp(&(b.app_id, b.service_id)));
        Ok(containers)
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        debug!(image, "SimulatedRuntime: pull_image");
        self.inner.write().await.images.insert(image.to_string());
        Ok(())
    }

    async fn start_service(
        &self,
        app_id: AppId,
        app_name: &str,
        service: &Service,
    ) -> Result<String, RuntimeError> {
        let mut guard = self.inner.write().await;
        if !guard.images.contains(&service.config.image) {
            return Err(RuntimeError::ImageNotPresent(service.config.image.clone()));
        }
        let container_id = Uuid::new_v4().simple().to_string();
        for volume in crate::runtime::named_volumes(&service.config) {
            guard.volumes.insert(volume);
        }
        guard.containers.insert(
            container_id.clone(),
            ManagedContainer {
                container_id: container_id.clone(),
                app_id,
                app_name: app_name.to_string(),
                service_id: service.service_id,
                service_name: service.service_name.clone(),
                image: service.config.image.clone(),
                status: ServiceStatus::Running,
                config: service.config.clone(),
            },
        );
        Ok(container_id)
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut guard = self.inner.write().await;
        let container = guard
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        container.status = ServiceStatus::Stopped;
        Ok(())
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut guard = self.inner.write().await;
        let container = guard
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        container.status = ServiceStatus::Running;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut guard = self.inner.write().await;
        guard
            .containers
            .remove(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        Ok(())
    }

    async fn remove_volumes(&self, names: &[String]) -> Result<(), RuntimeError> {
        let mut guard = self.inner.write().await;
        for name in names {
            guard.volumes.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_domain::{ServiceConfig, ServiceId};

    fn service(id: i64, image: &str) -> Service {
        Service::new(
            ServiceId(id),
            format!("svc-{}", id),
            image,
            ServiceConfig { image: image.into(), ..Default::default() },
        )
    }

    #[tokio::test]
    async fn start_requires_pulled_image() {
        let rt = SimulatedRuntime::new();
        let svc = service(1, "nginx:1.25");
        assert!(matches!(
            rt.start_service(AppId(1), "web", &svc).await,
            Err(RuntimeError::ImageNotPresent(_))
        ));

        rt.pull_image("nginx:1.25").await.unwrap();
        let id = rt.start_service(AppId(1), "web", &svc).await.unwrap();

        let listed = rt.list_managed().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].container_id, id);
        assert_eq!(listed[0].status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn stop_start_remove_lifecycle() {
        let rt = SimulatedRuntime::new();
        rt.pull_image("nginx:1.25").await.unwrap();
        let id = rt.start_service(AppId(1), "web", &service(1, "nginx:1.25")).await.unwrap();

        rt.stop_container(&id).await.unwrap();
        assert_eq!(rt.list_managed().await.unwrap()[0].status, ServiceStatus::Stopped);

        rt.start_container(&id).await.unwrap();
        assert_eq!(rt.list_managed().await.unwrap()[0].status, ServiceStatus::Running);

        rt.stop_container(&id).await.unwrap();
        rt.remove_container(&id).await.unwrap();
        assert!(rt.list_managed().await.unwrap().is_empty());
        assert!(matches!(
            rt.remove_container(&id).await,
            Err(RuntimeError::ContainerNotFound(_))
        ));
    }
}
