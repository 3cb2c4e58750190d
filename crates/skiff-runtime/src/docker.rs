use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::volume::RemoveVolumeOptions;
use bollard::Docker;
use futures_util::TryStreamExt;
use skiff_domain::{AppId, RestartPolicy as ServiceRestart, Service, ServiceId, ServiceStatus};
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::runtime::{
    ContainerRuntime, ManagedContainer, APP_ID_LABEL, APP_NAME_LABEL, CONFIG_LABEL,
    MANAGED_LABEL, SERVICE_ID_LABEL, SERVICE_NAME_LABEL,
};

/// Container runtime backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    /// Seconds to wait after SIGTERM before the daemon sends SIGKILL.
    stop_grace_secs: i64,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, stop_grace_secs: 10 })
    }

    fn managed_filters() -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);
        filters
    }

    fn labels_for(app_id: AppId, app_name: &str, service: &Service) -> Result<HashMap<String, String>, RuntimeError> {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(APP_ID_LABEL.to_string(), app_id.to_string());
        labels.insert(APP_NAME_LABEL.to_string(), app_name.to_string());
        labels.insert(SERVICE_ID_LABEL.to_string(), service.service_id.to_string());
        labels.insert(SERVICE_NAME_LABEL.to_string(), service.service_name.clone());
        labels.insert(CONFIG_LABEL.to_string(), serde_json::to_string(&service.config)?);
        Ok(labels)
    }

    fn parse_managed(
        container_id: String,
        image: String,
        state: Option<&str>,
        labels: &HashMap<String, String>,
    ) -> Result<ManagedContainer, RuntimeError> {
        let get = |key: &str| -> Result<&String, RuntimeError> {
            labels.get(key).ok_or_else(|| RuntimeError::InvalidLabels {
                container_id: container_id.clone(),
                message: format!("missing label {}", key),
            })
        };
        let app_id: i64 = get(APP_ID_LABEL)?.parse().map_err(|_| RuntimeError::InvalidLabels {
            container_id: container_id.clone(),
            message: format!("non-numeric {}", APP_ID_LABEL),
        })?;
        let service_id: i64 =
            get(SERVICE_ID_LABEL)?.parse().map_err(|_| RuntimeError::InvalidLabels {
                container_id: container_id.clone(),
                message: format!("non-numeric {}", SERVICE_ID_LABEL),
            })?;
        let config = serde_json::from_str(get(CONFIG_LABEL)?)?;

        let status = match state {
            Some("running") => ServiceStatus::Running,
            Some("exited") | Some("dead") => ServiceStatus::Exited,
            _ => ServiceStatus::Stopped,
        };

        Ok(ManagedContainer {
            container_id: container_id.clone(),
            app_id: AppId(app_id),
            app_name: get(APP_NAME_LABEL)?.clone(),
            service_id: ServiceId(service_id),
            service_name: get(SERVICE_NAME_LABEL)?.clone(),
            image,
            status,
            config,
        })
    }
}

fn restart_policy(policy: &ServiceRestart) -> RestartPolicy {
    let name = match policy {
        ServiceRestart::No => RestartPolicyNameEnum::NO,
        ServiceRestart::Always => RestartPolicyNameEnum::ALWAYS,
        ServiceRestart::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        ServiceRestart::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
    };
    RestartPolicy { name: Some(name), maximum_retry_count: None }
}

/// Split a `host:container` port mapping into Docker's exposed-port key and
/// host binding.
fn split_port_mapping(mapping: &str) -> Result<(String, PortBinding), RuntimeError> {
    let (host, container) = mapping
        .split_once(':')
        .ok_or_else(|| RuntimeError::InvalidPortMapping(mapping.to_string()))?;
    if host.parse::<u16>().is_err() || container.parse::<u16>().is_err() {
        return Err(RuntimeError::InvalidPortMapping(mapping.to_string()));
    }
    Ok((
        format!("{}/tcp", container),
        PortBinding { host_ip: None, host_port: Some(host.to_string()) },
    ))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: Self::managed_filters(),
                ..Default::default()
            }))
            .await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let (Some(id), Some(labels)) = (summary.id, summary.labels) else {
                continue;
            };
            let image = summary.image.unwrap_or_default();
            match Self::parse_managed(id, image, summary.state.as_deref(), &labels) {
                Ok(container) => containers.push(container),
                // A container with the managed label but a broken label set is
                // left alone; the operator has to clean it up by hand.
                Err(e) => warn!(error = %e, "skipping container with unreadable labels"),
            }
        }
        Ok(containers)
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        debug!(image, "pulling image");
        self.docker
            .create_image(
                Some(CreateImageOptions::<String> {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    async fn start_service(
        &self,
        app_id: AppId,
        app_name: &str,
        service: &Service,
    ) -> Result<String, RuntimeError> {
        let labels = Self::labels_for(app_id, app_name, service)?;
        let config = &service.config;

        let env: Vec<String> = config
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for mapping in &config.ports {
            let (exposed, binding) = split_port_mapping(mapping)?;
            exposed_ports.insert(exposed.clone(), HashMap::new());
            port_bindings.entry(exposed).or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(binding);
        }

        let host_config = HostConfig {
            binds: if config.volumes.is_empty() { None } else { Some(config.volumes.clone()) },
            port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
            restart_policy: Some(restart_policy(&config.restart)),
            privileged: Some(config.privileged),
            network_mode: config.network_mode.clone(),
            ..Default::default()
        };

        let name = format!("{}_{}_{}", service.service_name, app_id, service.service_id);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions { name, platform: None }),
                Config {
                    image: Some(config.image.clone()),
                    env: if env.is_empty() { None } else { Some(env) },
                    labels: Some(labels),
                    exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
                    host_config: Some(host_config),
                    ..Default::default()
                },
            )
            .await?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        debug!(container_id = %created.id, service = %service.service_name, "service started");
        Ok(created.id)
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: self.stop_grace_secs }))
            .await?;
        Ok(())
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions { force: false, ..Default::default() }),
            )
            .await?;
        Ok(())
    }

    async fn remove_volumes(&self, names: &[String]) -> Result<(), RuntimeError> {
        for name in names {
            match self
                .docker
                .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
                .await
            {
                Ok(()) => debug!(volume = %name, "volume removed"),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_mapping_splits() {
        let (exposed, binding) = split_port_mapping("8080:80").unwrap();
        assert_eq!(exposed, "80/tcp");
        assert_eq!(binding.host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn bad_port_mapping_rejected() {
        assert!(split_port_mapping("8080").is_err());
        assert!(split_port_mapping("eighty:80").is_err());
    }
}
