use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;

use super::super::AppState;
use crate::core::store::types::AgentStatus;

/// Aggregated host resources and fleet counts. `pending_agents` and
/// `waiting_agents` are aliases and always agree.
pub(crate) async fn get_status(State(state): State<AppState>) -> axum::response::Response {
    let supervisor = &state.supervisor;
    let usage = supervisor.resources.current_usage().await;
    let can_run = supervisor.resources.can_run_agent().await;
    let throttle = supervisor.resources.should_throttle().await;
    let max_concurrent = supervisor
        .concurrency
        .max_concurrent(&supervisor.resources, false)
        .await;

    let active = supervisor
        .store
        .count_agents_with_statuses(&[AgentStatus::Active])
        .await
        .unwrap_or(0);
    let waiting = supervisor
        .store
        .count_agents_with_statuses(&[AgentStatus::Waiting, AgentStatus::Pending])
        .await
        .unwrap_or(0);

    Json(json!({
        "cpu_percent": usage.cpu_percent,
        "memory_mb": usage.memory_mb,
        "memory_percent": usage.memory_percent,
        "available_memory_mb": usage.available_memory_mb,
        "running_processes": usage.running_processes,
        "max_concurrent": max_concurrent,
        "can_run_agent": can_run,
        "should_throttle": throttle,
        "active_agents": active,
        "pending_agents": waiting,
        "waiting_agents": waiting,
        "inflight_heartbeats": supervisor.scheduler.inflight_count().await,
        "scheduled_agents": supervisor.scheduler.scheduled_agents().await.len(),
    }))
    .into_response()
}

pub(crate) async fn get_config(State(state): State<AppState>) -> axum::response::Response {
    match serde_json::to_value(state.supervisor.config.get()) {
        Ok(config) => Json(config).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": e.to_string() })),
        )
            .into_response(),
    }
}

/// Deep-merge updates into the YAML on disk, then reload the cache.
pub(crate) async fn update_config(
    State(state): State<AppState>,
    Json(updates): Json<serde_json::Value>,
) -> axum::response::Response {
    if !updates.is_object() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "Expected a JSON object of config sections" })),
        )
            .into_response();
    }
    match state.supervisor.config.apply_updates(&updates) {
        Ok(()) => Json(json!({
            "success": true,
            "message": "Configuration updated",
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": e.to_string() })),
        )
            .into_response(),
    }
}

pub(crate) async fn reload_config(State(state): State<AppState>) -> axum::response::Response {
    match state.supervisor.config.reload() {
        Ok(()) => Json(json!({ "success": true, "message": "Configuration reloaded" }))
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": e.to_string() })),
        )
            .into_response(),
    }
}
