use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use skiff_domain::AppId;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::ApiState;

pub async fn ping() -> &'static str {
    "OK"
}

/// 200 when both the reconciler and the cloud sync loop ticked within the
/// watchdog window. Local-only agents skip the sync check.
pub async fn healthy(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let now = Utc::now();
    let window = state.watchdog_window_chrono();

    let reconciler_at = state.reconciler.last_run_at().await;
    let reconciler_alive = reconciler_at.map_or(false, |t| now - t <= window);

    let sync_alive = match &state.sync_liveness {
        Some(liveness) => liveness.read().await.map_or(false, |t| now - t <= window),
        None => true,
    };

    if reconciler_alive && sync_alive {
        Ok(Json(json!({
            "healthy": true,
            "reconciler_last_run": reconciler_at,
            "last_error": state.reconciler.last_error().await,
        })))
    } else {
        Err(ApiError::internal("watchdog window exceeded"))
    }
}

pub async fn device(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!(&*state.device))
}

pub async fn applications_state(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let current = state
        .reconciler
        .current_state()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({
        "apps": current.apps,
        "last_error": state.reconciler.last_error().await,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RestartRequest {
    pub app_id: i64,
    #[serde(default)]
    pub force: bool,
}

/// Asynchronous restart: validates the app, then runs the recreate under the
/// reconciler lock in the background. Returns a job id immediately;
/// `GET /v1/healthy` reflects progress.
pub async fn restart(
    State(state): State<ApiState>,
    Json(request): Json<RestartRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let app_id = AppId(request.app_id);
    let current = state
        .reconciler
        .current_state()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if !current.apps.contains_key(&app_id) {
        return Err(ApiError::not_found(format!("app {} not found", app_id)));
    }

    let job_id = Uuid::new_v4();
    let reconciler = state.reconciler.clone();
    tokio::spawn(async move {
        info!(%job_id, %app_id, "restart job started");
        if let Err(e) = reconciler.restart_app(app_id).await {
            warn!(%job_id, %app_id, error = %e, "restart job failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id, "status": "accepted" }))))
}

#[derive(Debug, Deserialize, Default)]
pub struct ForceRequest {
    #[serde(default)]
    pub force: bool,
}

pub async fn stop_app(
    State(state): State<ApiState>,
    Path(app_id): Path<i64>,
    _body: Option<Json<ForceRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (container_id, status) = state.reconciler.stop_app(AppId(app_id)).await?;
    Ok(Json(json!({ "container_id": container_id, "status": status })))
}

pub async fn start_app(
    State(state): State<ApiState>,
    Path(app_id): Path<i64>,
    _body: Option<Json<ForceRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (container_id, status) = state.reconciler.start_app(AppId(app_id)).await?;
    Ok(Json(json!({ "container_id": container_id, "status": status })))
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    pub app_id: i64,
    #[serde(default)]
    pub force: bool,
}

pub async fn purge(
    State(state): State<ApiState>,
    Json(request): Json<PurgeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.reconciler.purge_app(AppId(request.app_id)).await?;
    Ok(Json(json!({ "status": "ok" })))
}
