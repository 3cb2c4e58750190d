use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_domain::{AppId, DeviceState, ServiceStatus};
use skiff_runtime::{named_volumes, ContainerRuntime};
use skiff_store::{compute_state_hash, DeviceStore, SnapshotKind};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::planner::{current_state_from, plan, Step};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReconcileReport {
    /// Planning was skipped because neither current nor target changed.
    pub skipped: bool,
    pub steps: Vec<Step>,
    /// Non-noop steps that completed.
    pub executed: usize,
    pub errors: Vec<String>,
}

/// Plans and applies state transitions against the container runtime.
///
/// At most one plan executes per agent: all mutating entry points funnel
/// through a single-slot mutex. Reconcile requests that arrive while a run
/// is in flight are coalesced into one follow-up run.
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn DeviceStore>,
    target: RwLock<DeviceState>,
    lock: Mutex<()>,
    pending: AtomicBool,
    /// Canonical hash of the (current, target) pair at the last clean run.
    last_plan_hash: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
    last_run_at: RwLock<Option<DateTime<Utc>>>,
    last_success_at: RwLock<Option<DateTime<Utc>>>,
}

impl Reconciler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<dyn DeviceStore>) -> Self {
        Self {
            runtime,
            store,
            target: RwLock::new(DeviceState::new()),
            lock: Mutex::new(()),
            pending: AtomicBool::new(false),
            last_plan_hash: RwLock::new(None),
            last_error: RwLock::new(None),
            last_run_at: RwLock::new(None),
            last_success_at: RwLock::new(None),
        }
    }

    /// Replace the in-memory target. The caller decides when to reconcile.
    pub async fn set_target(&self, target: DeviceState) {
        *self.target.write().await = target;
    }

    pub async fn target(&self) -> DeviceState {
        self.target.read().await.clone()
    }

    /// Read current state from the runtime.
    pub async fn current_state(&self) -> Result<DeviceState, EngineError> {
        let containers = self.runtime.list_managed().await?;
        Ok(current_state_from(&containers))
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// When this reconciler last attempted a run — the liveness signal for
    /// the local API watchdog.
    pub async fn last_run_at(&self) -> Option<DateTime<Utc>> {
        *self.last_run_at.read().await
    }

    pub async fn last_success_at(&self) -> Option<DateTime<Utc>> {
        *self.last_success_at.read().await
    }

    // ── Reconcile ─────────────────────────────────────────────────────────────

    /// Run reconciliation. Returns `Ok(None)` when another run is already in
    /// flight; that run picks up the request as a follow-up before releasing
    /// the lock.
    pub async fn reconcile(&self) -> Result<Option<ReconcileReport>, EngineError> {
        self.pending.store(true, Ordering::SeqCst);
        let Ok(_guard) = self.lock.try_lock() else {
            debug!("reconcile already in flight, coalescing");
            return Ok(None);
        };

        let mut report = None;
        while self.pending.swap(false, Ordering::SeqCst) {
            report = Some(self.run_once().await?);
        }
        Ok(report)
    }

    async fn run_once(&self) -> Result<ReconcileReport, EngineError> {
        *self.last_run_at.write().await = Some(Utc::now());

        let current = self.current_state().await?;
        let target = self.target.read().await.clone();

        let pair_hash = compute_state_hash(&(&current, &target));
        if self.last_plan_hash.read().await.as_deref() == Some(pair_hash.as_str()) {
            debug!("current and target unchanged, skipping plan");
            *self.last_success_at.write().await = Some(Utc::now());
            return Ok(ReconcileReport { skipped: true, ..Default::default() });
        }

        let steps = plan(&current, &target);
        let work: usize = steps.iter().filter(|s| !s.is_noop()).count();
        info!(steps = steps.len(), work, "executing reconcile plan");

        let mut report = ReconcileReport { steps: steps.clone(), ..Default::default() };
        for step in &steps {
            match self.execute(step).await {
                Ok(()) => {
                    if !step.is_noop() {
                        report.executed += 1;
                    }
                }
                Err(e) => {
                    // Abandon the run; the next tick retries the remainder.
                    let msg = format!("{} failed: {}", step_name(step), e);
                    warn!(error = %e, step = step_name(step), "reconcile step failed");
                    *self.last_error.write().await = Some(msg.clone());
                    report.errors.push(msg);
                    break;
                }
            }
        }

        // Persist what actually happened, even after a partial run.
        let observed = self.current_state().await?;
        self.store
            .save_snapshot(SnapshotKind::Current, &serde_json::to_value(&observed)?)
            .await?;

        if report.errors.is_empty() {
            *self.last_error.write().await = None;
            *self.last_success_at.write().await = Some(Utc::now());
            let settled = compute_state_hash(&(&observed, &target));
            *self.last_plan_hash.write().await = Some(settled);
        } else {
            *self.last_plan_hash.write().await = None;
        }
        Ok(report)
    }

    async fn execute(&self, step: &Step) -> Result<(), EngineError> {
        match step {
            Step::PullImage { image } => self.runtime.pull_image(image).await?,
            Step::StartService { app_id, app_name, service } => {
                self.runtime.start_service(*app_id, app_name, service).await?;
            }
            Step::StopService { container_id } => {
                self.runtime.stop_container(container_id).await?;
            }
            Step::RemoveService { container_id } => {
                self.runtime.remove_container(container_id).await?;
            }
            Step::RecreateService { old_container_id, app_id, app_name, service } => {
                self.runtime.stop_container(old_container_id).await?;
                self.runtime.remove_container(old_container_id).await?;
                self.runtime.start_service(*app_id, app_name, service).await?;
            }
            Step::NoOp { .. } => {}
        }
        Ok(())
    }

    // ── Manual control (local API) ────────────────────────────────────────────

    /// Recreate every service of `app_id` from its current config. Waits for
    /// any in-flight reconcile to finish first.
    pub async fn restart_app(&self, app_id: AppId) -> Result<(), EngineError> {
        let _guard = self.lock.lock().await;
        let current = self.current_state().await?;
        let app = current
            .apps
            .get(&app_id)
            .ok_or(EngineError::AppNotFound(app_id))?
            .clone();

        for service in &app.services {
            if let Some(container_id) = &service.container_id {
                self.runtime.stop_container(container_id).await?;
                self.runtime.remove_container(container_id).await?;
            }
            self.runtime.pull_image(&service.config.image).await?;
            self.runtime.start_service(app_id, &app.app_name, service).await?;
        }
        self.persist_current().await
    }

    /// Stop the single service of `app_id`. Refuses multi-service apps.
    pub async fn stop_app(&self, app_id: AppId) -> Result<(String, ServiceStatus), EngineError> {
        let _guard = self.lock.try_lock().map_err(|_| EngineError::Busy)?;
        let container_id = self.single_container(app_id).await?;
        self.runtime.stop_container(&container_id).await?;
        self.persist_current().await?;
        Ok((container_id, ServiceStatus::Stopped))
    }

    /// Start the single service of `app_id`.
    pub async fn start_app(&self, app_id: AppId) -> Result<(String, ServiceStatus), EngineError> {
        let _guard = self.lock.try_lock().map_err(|_| EngineError::Busy)?;
        let container_id = self.single_container(app_id).await?;
        self.runtime.start_container(&container_id).await?;
        self.persist_current().await?;
        Ok((container_id, ServiceStatus::Running))
    }

    /// Remove the named volumes referenced by `app_id`'s services.
    pub async fn purge_app(&self, app_id: AppId) -> Result<(), EngineError> {
        let _guard = self.lock.try_lock().map_err(|_| EngineError::Busy)?;
        let current = self.current_state().await?;
        let app = current.apps.get(&app_id).ok_or(EngineError::AppNotFound(app_id))?;

        let mut volumes = Vec::new();
        for service in &app.services {
            volumes.extend(named_volumes(&service.config));
        }
        volumes.sort();
        volumes.dedup();
        self.runtime.remove_volumes(&volumes).await?;
        Ok(())
    }

    async fn single_container(&self, app_id: AppId) -> Result<String, EngineError> {
        let current = self.current_state().await?;
        let app = current.apps.get(&app_id).ok_or(EngineError::AppNotFound(app_id))?;
        match app.services.as_slice() {
            [service] => service
                .container_id
                .clone()
                .ok_or(EngineError::AppNotFound(app_id)),
            _ => Err(EngineError::AmbiguousApp(app_id)),
        }
    }

    async fn persist_current(&self) -> Result<(), EngineError> {
        let observed = self.current_state().await?;
        self.store
            .save_snapshot(SnapshotKind::Current, &serde_json::to_value(&observed)?)
            .await?;
        // Manual mutations invalidate the planner's settled hash.
        *self.last_plan_hash.write().await = None;
        Ok(())
    }
}

fn step_name(step: &Step) -> &'static str {
    match step {
        Step::PullImage { .. } => "PullImage",
        Step::StartService { .. } => "StartService",
        Step::StopService { .. } => "StopService",
        Step::RemoveService { .. } => "RemoveService",
        Step::RecreateService { .. } => "RecreateService",
        Step::NoOp { .. } => "NoOp",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skiff_domain::{App, Service, ServiceConfig, ServiceId};
    use skiff_runtime::{ManagedContainer, RuntimeError, SimulatedRuntime};
    use skiff_store::InMemoryStore;

    fn target(entries: &[(i64, i64, &str)]) -> DeviceState {
        let mut s = DeviceState::new();
        for (app_id, service_id, image) in entries {
            let app = s.apps.entry(AppId(*app_id)).or_insert_with(|| App {
                app_id: AppId(*app_id),
                app_name: format!("app-{}", app_id),
                services: Vec::new(),
            });
            app.services.push(Service::new(
                ServiceId(*service_id),
                format!("svc-{}", service_id),
                *image,
                ServiceConfig { image: (*image).into(), ..Default::default() },
            ));
        }
        s
    }

    fn reconciler(runtime: Arc<dyn ContainerRuntime>) -> Reconciler {
        Reconciler::new(runtime, Arc::new(InMemoryStore::new()))
    }

    /// After a clean apply, the runtime's managed set matches the target's
    /// service keys and configs exactly.
    async fn assert_converged(r: &Reconciler, t: &DeviceState) {
        let current = r.current_state().await.unwrap();
        assert_eq!(current.service_keys(), t.service_keys());
        for (app_id, service_id) in t.service_keys() {
            let want = &t.service(app_id, service_id).unwrap().config;
            let got = &current.service(app_id, service_id).unwrap().config;
            assert!(got.matches(want), "config diverged for {}/{}", app_id, service_id);
        }
    }

    #[tokio::test]
    async fn apply_reaches_target() {
        let runtime = Arc::new(SimulatedRuntime::new());
        let r = reconciler(runtime.clone());
        let t = target(&[(1, 1, "nginx:1.25"), (1, 2, "redis:7")]);

        r.set_target(t.clone()).await;
        let report = r.reconcile().await.unwrap().unwrap();
        assert!(report.errors.is_empty());
        assert_eq!(report.executed, 4); // 2 pulls + 2 starts
        assert_converged(&r, &t).await;
        assert!(runtime.has_image("nginx:1.25").await);
    }

    #[tokio::test]
    async fn second_run_is_skipped() {
        let r = reconciler(Arc::new(SimulatedRuntime::new()));
        r.set_target(target(&[(1, 1, "nginx:1.25")])).await;
        r.reconcile().await.unwrap().unwrap();

        let report = r.reconcile().await.unwrap().unwrap();
        assert!(report.skipped);
        assert_eq!(report.executed, 0);
    }

    #[tokio::test]
    async fn image_upgrade_recreates_single_container() {
        let r = reconciler(Arc::new(SimulatedRuntime::new()));
        r.set_target(target(&[(1, 1, "nginx:1.24")])).await;
        r.reconcile().await.unwrap().unwrap();
        let before = r.current_state().await.unwrap();
        let old_id = before.service(AppId(1), ServiceId(1)).unwrap().container_id.clone();

        let t = target(&[(1, 1, "nginx:1.25")]);
        r.set_target(t.clone()).await;
        let report = r.reconcile().await.unwrap().unwrap();
        assert!(report.errors.is_empty());
        assert_converged(&r, &t).await;

        let after = r.current_state().await.unwrap();
        let new = after.service(AppId(1), ServiceId(1)).unwrap();
        assert_eq!(new.config.image, "nginx:1.25");
        assert_ne!(new.container_id, old_id);
        assert_eq!(after.service_keys().len(), 1);
    }

    #[tokio::test]
    async fn removed_app_is_torn_down() {
        let r = reconciler(Arc::new(SimulatedRuntime::new()));
        r.set_target(target(&[(1, 1, "nginx:1.25"), (2, 1, "redis:7")])).await;
        r.reconcile().await.unwrap().unwrap();

        let t = target(&[(1, 1, "nginx:1.25")]);
        r.set_target(t.clone()).await;
        r.reconcile().await.unwrap().unwrap();
        assert_converged(&r, &t).await;
    }

    /// Runtime wrapper that fails every pull until released.
    struct FlakyRuntime {
        inner: SimulatedRuntime,
        fail_pulls: AtomicBool,
    }

    #[async_trait]
    impl ContainerRuntime for FlakyRuntime {
        async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
            self.inner.list_managed().await
        }
        async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
            if self.fail_pulls.load(Ordering::SeqCst) {
                return Err(RuntimeError::ImageNotPresent(image.to_string()));
            }
            self.inner.pull_image(image).await
        }
        async fn start_service(
            &self,
            app_id: AppId,
            app_name: &str,
            service: &Service,
        ) -> Result<String, RuntimeError> {
            self.inner.start_service(app_id, app_name, service).await
        }
        async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.inner.stop_container(id).await
        }
        async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.inner.start_container(id).await
        }
        async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.inner.remove_container(id).await
        }
        async fn remove_volumes(&self, names: &[String]) -> Result<(), RuntimeError> {
            self.inner.remove_volumes(names).await
        }
    }

    #[tokio::test]
    async fn step_failure_aborts_run_and_next_tick_retries() {
        let runtime = Arc::new(FlakyRuntime {
            inner: SimulatedRuntime::new(),
            fail_pulls: AtomicBool::new(true),
        });
        let r = reconciler(runtime.clone());
        let t = target(&[(1, 1, "nginx:1.25")]);
        r.set_target(t.clone()).await;

        let report = r.reconcile().await.unwrap().unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.executed, 0);
        assert!(r.last_error().await.is_some());
        assert!(r.current_state().await.unwrap().is_empty());

        // Transient failure clears; the next tick converges.
        runtime.fail_pulls.store(false, Ordering::SeqCst);
        let report = r.reconcile().await.unwrap().unwrap();
        assert!(report.errors.is_empty());
        assert!(r.last_error().await.is_none());
        assert_converged(&r, &t).await;
    }

    #[tokio::test]
    async fn restart_recreates_all_services() {
        let r = reconciler(Arc::new(SimulatedRuntime::new()));
        r.set_target(target(&[(1, 1, "nginx:1.25"), (1, 2, "redis:7")])).await;
        r.reconcile().await.unwrap().unwrap();
        let before: Vec<_> = r
            .current_state()
            .await
            .unwrap()
            .apps[&AppId(1)]
            .services
            .iter()
            .map(|s| s.container_id.clone().unwrap())
            .collect();

        r.restart_app(AppId(1)).await.unwrap();

        let after: Vec<_> = r
            .current_state()
            .await
            .unwrap()
            .apps[&AppId(1)]
            .services
            .iter()
            .map(|s| s.container_id.clone().unwrap())
            .collect();
        assert_eq!(before.len(), after.len());
        assert!(before.iter().all(|id| !after.contains(id)));
    }

    #[tokio::test]
    async fn stop_and_start_single_service() {
        let r = reconciler(Arc::new(SimulatedRuntime::new()));
        r.set_target(target(&[(1, 1, "nginx:1.25")])).await;
        r.reconcile().await.unwrap().unwrap();

        let (id, status) = r.stop_app(AppId(1)).await.unwrap();
        assert_eq!(status, ServiceStatus::Stopped);
        let (id2, status) = r.start_app(AppId(1)).await.unwrap();
        assert_eq!(id, id2);
        assert_eq!(status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn stop_refuses_multi_service_app() {
        let r = reconciler(Arc::new(SimulatedRuntime::new()));
        r.set_target(target(&[(1, 1, "nginx:1.25"), (1, 2, "redis:7")])).await;
        r.reconcile().await.unwrap().unwrap();
        assert!(matches!(r.stop_app(AppId(1)).await, Err(EngineError::AmbiguousApp(_))));
    }

    #[tokio::test]
    async fn purge_removes_named_volumes() {
        let runtime = Arc::new(SimulatedRuntime::new());
        let r = reconciler(runtime.clone());
        let mut t = target(&[(1, 1, "nginx:1.25")]);
        t.apps.get_mut(&AppId(1)).unwrap().services[0].config.volumes =
            vec!["data:/data".into()];
        r.set_target(t).await;
        r.reconcile().await.unwrap().unwrap();
        assert!(runtime.has_volume("data").await);

        r.purge_app(AppId(1)).await.unwrap();
        assert!(!runtime.has_volume("data").await);
    }
}
