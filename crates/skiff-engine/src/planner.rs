use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use skiff_domain::{App, AppId, DeviceState, Service, ServiceId};
use skiff_runtime::ManagedContainer;

// ── Steps ─────────────────────────────────────────────────────────────────────

/// One unit of work transitioning current state toward target state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Step {
    /// Ensure `image` is present locally. Idempotent.
    PullImage { image: String },
    /// Create and start a container for a service new in the target.
    StartService { app_id: AppId, app_name: String, service: Service },
    /// Graceful stop of a container no longer in the target.
    StopService { container_id: String },
    /// Remove a stopped container.
    RemoveService { container_id: String },
    /// Stop + remove + start for a service whose config changed.
    RecreateService {
        old_container_id: String,
        app_id: AppId,
        app_name: String,
        service: Service,
    },
    /// Service present and unchanged in both states.
    NoOp { app_id: AppId, service_id: ServiceId },
}

impl Step {
    pub fn is_noop(&self) -> bool {
        matches!(self, Step::NoOp { .. })
    }
}

// ── Planning ──────────────────────────────────────────────────────────────────

/// Compute the ordered step sequence that transitions `current` to `target`.
///
/// Pure: no I/O, deterministic for a given input pair. Ordering:
/// 1. `PullImage` for every added/changed service image (dedup'd, sorted);
/// 2. `StopService` + `RemoveService` for deletions;
/// 3. `RecreateService` / `StartService` for changes and additions, apps in
///    id order and services in service-id order within an app;
/// 4. `NoOp` for every unchanged service.
pub fn plan(current: &DeviceState, target: &DeviceState) -> Vec<Step> {
    let mut pulls: BTreeSet<String> = BTreeSet::new();
    let mut removals: Vec<Step> = Vec::new();
    let mut changes: Vec<Step> = Vec::new();
    let mut noops: Vec<Step> = Vec::new();

    // Deletions: present in current only.
    for (app_id, app) in &current.apps {
        for service in &app.services {
            if target.service(*app_id, service.service_id).is_some() {
                continue;
            }
            if let Some(container_id) = &service.container_id {
                removals.push(Step::StopService { container_id: container_id.clone() });
                removals.push(Step::RemoveService { container_id: container_id.clone() });
            }
        }
    }

    // Additions and changes: walk the target in deterministic order.
    for (app_id, app) in &target.apps {
        let mut services: Vec<&Service> = app.services.iter().collect();
        services.sort_by_key(|s| s.service_id);

        for service in services {
            match current.service(*app_id, service.service_id) {
                None => {
                    pulls.insert(service.config.image.clone());
                    changes.push(Step::StartService {
                        app_id: *app_id,
                        app_name: app.app_name.clone(),
                        service: service.clone(),
                    });
                }
                Some(existing) if existing.config.matches(&service.config) => {
                    noops.push(Step::NoOp { app_id: *app_id, service_id: service.service_id });
                }
                Some(existing) => {
                    pulls.insert(service.config.image.clone());
                    changes.push(Step::RecreateService {
                        old_container_id: existing.container_id.clone().unwrap_or_default(),
                        app_id: *app_id,
                        app_name: app.app_name.clone(),
                        service: service.clone(),
                    });
                }
            }
        }
    }

    let mut steps: Vec<Step> =
        pulls.into_iter().map(|image| Step::PullImage { image }).collect();
    steps.extend(removals);
    steps.extend(changes);
    steps.extend(noops);
    steps
}

// ── Current state derivation ──────────────────────────────────────────────────

/// Build a [`DeviceState`] from the managed containers the runtime reports.
pub fn current_state_from(containers: &[ManagedContainer]) -> DeviceState {
    let mut apps: BTreeMap<AppId, App> = BTreeMap::new();
    for c in containers {
        let app = apps.entry(c.app_id).or_insert_with(|| App {
            app_id: c.app_id,
            app_name: c.app_name.clone(),
            services: Vec::new(),
        });
        app.services.push(Service {
            service_id: c.service_id,
            service_name: c.service_name.clone(),
            image_name: c.config.image.clone(),
            config: c.config.clone(),
            status: Some(c.status),
            container_id: Some(c.container_id.clone()),
        });
    }
    for app in apps.values_mut() {
        app.services.sort_by_key(|s| s.service_id);
    }
    DeviceState { apps }
}
