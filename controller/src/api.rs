use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use heating_common::{HeatingConfig, ScheduleLookupError, WatchdogHealth};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{
    host::AppState,
    service::{self, ScheduleEnabledRequest, ServiceError},
};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct EntrySummary {
    entry_id: String,
    title: String,
    schedule_count: usize,
    watchdog: Option<WatchdogHealth>,
}

#[derive(Debug, Serialize)]
struct ChangeResponse {
    changed: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/entries", get(handle_get_entries))
        .route("/api/snapshot", get(handle_get_snapshot))
        .route("/api/refresh", post(handle_refresh))
        .route("/api/schedule/enabled", post(handle_set_schedule_enabled))
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_get_entries(State(state): State<AppState>) -> impl IntoResponse {
    let mut entries = Vec::new();
    for handle in state.instances.iter() {
        let schedule_count = handle.config().await.schedules.len();
        entries.push(EntrySummary {
            entry_id: handle.entry_id.clone(),
            title: handle.title.clone(),
            schedule_count,
            watchdog: handle.snapshot().map(|s| s.diagnostics.watchdog),
        });
    }
    Json(entries)
}

async fn handle_get_snapshot(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let handle = match state.instances.resolve(entry_param(&params)) {
        Ok(handle) => handle,
        Err(err) => return service_error_response(&err),
    };

    match handle.snapshot() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "No heating cycle has completed yet",
        ),
    }
}

async fn handle_refresh(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let force = params
        .get("force")
        .is_some_and(|value| matches!(value.as_str(), "1" | "true" | "yes"));

    match service::refresh(&state.instances, entry_param(&params), force) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => service_error_response(&err),
    }
}

async fn handle_set_schedule_enabled(
    State(state): State<AppState>,
    Json(request): Json<ScheduleEnabledRequest>,
) -> impl IntoResponse {
    match service::set_schedule_enabled(&state.instances, &state.store, &request).await {
        Ok(changed) => Json(ChangeResponse { changed }).into_response(),
        Err(err) => service_error_response(&err),
    }
}

async fn handle_get_config(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    match state.instances.resolve(entry_param(&params)) {
        Ok(handle) => Json(handle.config().await).into_response(),
        Err(err) => service_error_response(&err),
    }
}

async fn handle_put_config(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Json(config): Json<HeatingConfig>,
) -> impl IntoResponse {
    match service::replace_config(&state.instances, &state.store, entry_param(&params), config).await {
        Ok(applied) => Json(applied).into_response(),
        Err(err) => service_error_response(&err),
    }
}

fn entry_param(params: &HashMap<String, String>) -> Option<&str> {
    params.get("entry_id").map(String::as_str)
}

fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::UnknownEntry(_)
        | ServiceError::Schedule(ScheduleLookupError::NotFound(_)) => StatusCode::NOT_FOUND,
        ServiceError::NoEntries
        | ServiceError::AmbiguousEntry(_)
        | ServiceError::Schedule(_) => StatusCode::BAD_REQUEST,
        ServiceError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn service_error_response(err: &ServiceError) -> axum::response::Response {
    let status = status_for(err);
    if status.is_server_error() {
        warn!("request failed: {err:#}");
    }
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
