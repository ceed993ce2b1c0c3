// REST handlers
//
// Read endpoints over the store, control endpoints over the scheduler
// and the host service manager, and the config swap. Sensitive
// endpoints (log tailing, service control) only accept allow-listed
// names; everything else is rejected before dispatch.

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{ApiError, ApiResult};
use super::ApiState;
use crate::config::{tail_file, Config};
use crate::error::Error;
use crate::health::system;
use crate::scheduler::JobState;
use crate::store::{AppState, DashboardSettings, ScanSession, WifiDetection};
use crate::widgets;

/// Upper bound on /api/status results.
const STATUS_LIMIT_MAX: usize = 100;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    limit: Option<usize>,
}

/// Most recent health records, newest first. With PW_HEALTH_FILE set
/// the file contents are served instead; malformed contents are a
/// storage fault, never an empty 200.
pub async fn get_status(
    State(state): State<ApiState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<Value>> {
    let config = state.config.snapshot();
    let limit = query.limit.unwrap_or(10).clamp(1, STATUS_LIMIT_MAX);

    if let Some(path) = &config.health_file {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::storage(format!("{}: {e}", path.display())))?;
        let records: Value = serde_json::from_str(&contents)
            .map_err(|e| Error::storage(format!("{}: {e}", path.display())))?;
        return Ok(Json(records));
    }

    let records = state.store.load_recent_health(limit)?;
    Ok(Json(json!(records)))
}

#[derive(Debug, Deserialize)]
pub struct WidgetsQuery {
    #[serde(default)]
    detail: bool,
}

/// Stable widget name list; ?detail=1 adds a snapshot from the newest
/// sample.
pub async fn get_widgets(
    State(state): State<ApiState>,
    Query(query): Query<WidgetsQuery>,
) -> ApiResult<Json<Value>> {
    let config = state.config.snapshot();
    let names = widgets::enabled_names(&config);
    if !query.detail {
        return Ok(Json(json!({ "widgets": names })));
    }

    let latest = state.store.load_recent_health(1)?.into_iter().next();
    let detail: Vec<Value> = names
        .iter()
        .filter_map(|name| widgets::find(name))
        .map(|widget| {
            json!({
                "name": widget.name(),
                "metrics": latest.as_ref().map(|record| widget.snapshot(record)),
            })
        })
        .collect();
    Ok(Json(json!({ "widgets": names, "detail": detail })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    path: PathBuf,
    lines: Option<usize>,
}

/// Tail an allow-listed log file.
pub async fn get_logs(
    State(state): State<ApiState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Value>> {
    let config = state.config.snapshot();
    if !config.logging.log_paths.iter().any(|p| p == &query.path) {
        return Err(ApiError(Error::Forbidden(format!(
            "{} is not an allowed log path",
            query.path.display()
        ))));
    }
    let lines = tail_file(&query.path, query.lines.unwrap_or(200))?;
    Ok(Json(json!({ "path": query.path, "lines": lines })))
}

/// Start/stop/restart an allow-listed service unit.
pub async fn service_control(
    State(state): State<ApiState>,
    Path((name, action)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let config = state.config.snapshot();
    if !config.health.service_units.contains(&name) {
        return Err(ApiError(Error::validation(format!(
            "unknown service unit {name:?}"
        ))));
    }
    if !matches!(action.as_str(), "start" | "stop" | "restart") {
        return Err(ApiError(Error::validation(format!(
            "unknown service action {action:?}"
        ))));
    }

    system::service_control(&name, &action).await?;
    let active = system::service_active(&name).await.unwrap_or(false);
    Ok(Json(json!({ "active": active })))
}

/// Atomic replacement of the configuration document.
pub async fn post_config(
    State(state): State<ApiState>,
    Json(mut next): Json<Config>,
) -> ApiResult<Json<Config>> {
    // The test affordance is env-only; a client cannot smuggle it in
    next.health_file = state.config.snapshot().health_file.clone();
    let applied = state.config.replace(next)?;
    Ok(Json((*applied).clone()))
}

pub async fn get_config(State(state): State<ApiState>) -> Json<Config> {
    Json((*state.config.snapshot()).clone())
}

/// Store table counts and writer metrics, for observability.
pub async fn get_db_stats(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let counts = state.store.get_table_counts()?;
    let metrics = state.store.metrics();
    Ok(Json(json!({
        "tables": counts,
        "writer": {
            "records_written": metrics.records_written,
            "records_dropped": metrics.records_dropped,
            "write_failures": metrics.write_failures,
            "flush_count": metrics.flush_count,
            "avg_write_latency_us": metrics.avg_write_latency_us,
        },
    })))
}

/// Scheduler and queue metrics.
pub async fn get_jobs(State(state): State<ApiState>) -> Json<Value> {
    let jobs: serde_json::Map<String, Value> = state
        .scheduler
        .metrics()
        .into_iter()
        .map(|(name, m)| {
            (
                name,
                json!({
                    "state": match m.state {
                        JobState::Idle => "idle",
                        JobState::Scheduled => "scheduled",
                        JobState::Queued => "queued",
                        JobState::Running => "running",
                        JobState::Disabled => "disabled",
                    },
                    "runs": m.runs,
                    "consecutive_failures": m.consecutive_failures,
                    "last_error": m.last_error,
                    "last_duration_ms": m.last_duration.map(|d| d.as_millis() as u64),
                    "avg_duration_ms": m.average_duration_ewma.map(|d| d.as_millis() as u64),
                }),
            )
        })
        .collect();

    let queue = state.queue.metrics();
    Json(json!({
        "jobs": jobs,
        "queue": {
            "pending": queue.pending,
            "running": queue.running,
            "completed": queue.completed,
            "failed": queue.failed,
            "cancelled": queue.cancelled,
            "expired": queue.expired,
            "dropped": queue.dropped,
        },
    }))
}

/// Re-enable a job disabled after consecutive failures.
pub async fn enable_job(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.scheduler.metrics().contains_key(&name) {
        return Err(ApiError(Error::NotFound(format!("no job named {name:?}"))));
    }
    state.scheduler.enable(&name);
    Ok(Json(json!({ "enabled": name })))
}

pub async fn get_app_state(State(state): State<ApiState>) -> ApiResult<Json<AppState>> {
    Ok(Json(state.store.load_app_state()?))
}

pub async fn put_app_state(
    State(state): State<ApiState>,
    Json(app_state): Json<AppState>,
) -> ApiResult<Json<AppState>> {
    state.store.upsert_app_state(app_state).await?;
    Ok(Json(state.store.load_app_state()?))
}

pub async fn get_dashboard_settings(
    State(state): State<ApiState>,
) -> ApiResult<Json<DashboardSettings>> {
    Ok(Json(state.store.load_dashboard_settings()?))
}

pub async fn put_dashboard_settings(
    State(state): State<ApiState>,
    Json(settings): Json<DashboardSettings>,
) -> ApiResult<Json<DashboardSettings>> {
    state.store.replace_dashboard_settings(settings).await?;
    Ok(Json(state.store.load_dashboard_settings()?))
}

#[derive(Debug, Deserialize)]
pub struct NewScanSession {
    pub id: String,
    pub scan_type: String,
    pub notes: Option<String>,
}

pub async fn post_scan_session(
    State(state): State<ApiState>,
    Json(session): Json<NewScanSession>,
) -> ApiResult<Json<Value>> {
    state
        .store
        .create_scan_session(ScanSession {
            id: session.id.clone(),
            started_at: Utc::now(),
            scan_type: session.scan_type,
            notes: session.notes,
        })
        .await?;
    Ok(Json(json!({ "id": session.id })))
}

/// Ingest a batch of Wi-Fi detections from the scanner bridge; the
/// batch is appended to the store and pushed on the aps topic.
pub async fn post_wifi_detections(
    State(state): State<ApiState>,
    Json(detections): Json<Vec<WifiDetection>>,
) -> ApiResult<Json<Value>> {
    for detection in &detections {
        state.store.append_wifi(detection.clone()).await?;
        state
            .store
            .touch_fingerprint(&detection.bssid, detection.detection_timestamp)
            .await?;
    }
    let count = detections.len();
    state
        .bus
        .publish(crate::bus::TOPIC_APS, json!(detections));
    Ok(Json(json!({ "appended": count })))
}
