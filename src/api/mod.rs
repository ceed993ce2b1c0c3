// HTTP / streaming API surface
//
// One axum router: JSON read endpoints over the store, control
// endpoints over the scheduler and host services, bearer-token auth,
// and push endpoints (WebSocket + SSE) multiplexing the topic bus.
// Errors render through the taxonomy's single status table.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod stream;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::config::ConfigHandle;
use crate::queue::TaskQueue;
use crate::scheduler::Scheduler;
use crate::store::Store;
use auth::AuthState;

#[derive(Clone)]
pub struct ApiState {
    pub config: ConfigHandle,
    pub store: Arc<Store>,
    pub bus: Bus,
    pub scheduler: Arc<Scheduler>,
    pub queue: Arc<TaskQueue>,
    pub auth: Arc<AuthState>,
}

/// Build the application router. Everything except /auth/login sits
/// behind the bearer-token middleware (inactive when no password is
/// configured).
pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/widgets", get(handlers::get_widgets))
        .route("/api/logs", get(handlers::get_logs))
        .route(
            "/api/config",
            get(handlers::get_config).post(handlers::post_config),
        )
        .route("/api/db/stats", get(handlers::get_db_stats))
        .route("/api/jobs", get(handlers::get_jobs))
        .route("/api/jobs/:name/enable", post(handlers::enable_job))
        .route(
            "/api/app-state",
            get(handlers::get_app_state).put(handlers::put_app_state),
        )
        .route(
            "/api/dashboard-settings",
            get(handlers::get_dashboard_settings).put(handlers::put_dashboard_settings),
        )
        .route("/api/scan-sessions", post(handlers::post_scan_session))
        .route("/api/detections/wifi", post(handlers::post_wifi_detections))
        .route("/api/service/:name/:action", post(handlers::service_control))
        .route("/auth/logout", post(auth::logout))
        .route("/ws/aps", get(stream::ws_aps))
        .route("/ws/status", get(stream::ws_status))
        .route("/sse/aps", get(stream::sse_aps))
        .route("/sse/status", get(stream::sse_status))
        .route("/sse/history", get(stream::sse_history))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/auth/login", post(auth::login))
        .merge(protected)
        .with_state(state)
}

/// Serve until the cancellation token fires.
pub async fn serve(
    state: ApiState,
    listener: TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    tracing::info!("api listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await?;
    tracing::info!("api server shut down");
    Ok(())
}
