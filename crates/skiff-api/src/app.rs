use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::require_api_key;
use crate::handlers;
use crate::state::ApiState;

pub fn build_router(state: ApiState) -> Router {
    let authed = Router::new()
        .route("/v1/healthy", get(handlers::healthy))
        .route("/v1/device", get(handlers::device))
        .route("/v2/applications/state", get(handlers::applications_state))
        .route("/v1/restart", post(handlers::restart))
        .route("/v1/apps/:app_id/stop", post(handlers::stop_app))
        .route("/v1/apps/:app_id/start", post(handlers::start_app))
        .route("/v1/purge", post(handlers::purge))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/ping", get(handlers::ping))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the token cancels; in-flight requests finish.
pub async fn serve(
    router: Router,
    port: u16,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "local device API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
