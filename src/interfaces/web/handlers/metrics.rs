use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use crate::core::store::types::MetricValues;

fn error_response(status: StatusCode, detail: &str) -> axum::response::Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

pub(crate) async fn get_overview(State(state): State<AppState>) -> axum::response::Response {
    match state.supervisor.analytics.overview().await {
        Ok(overview) => Json(overview).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Deserialize)]
pub(crate) struct LeaderboardQuery {
    #[serde(default = "default_leaderboard_limit")]
    limit: i64,
}

fn default_leaderboard_limit() -> i64 {
    20
}

pub(crate) async fn get_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> axum::response::Response {
    match state.supervisor.analytics.leaderboard(query.limit).await {
        Ok(board) => Json(board).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Deserialize)]
pub(crate) struct AgentMetricsQuery {
    #[serde(default = "default_metrics_days")]
    days: i64,
}

fn default_metrics_days() -> i64 {
    7
}

pub(crate) async fn get_agent_metrics(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<AgentMetricsQuery>,
) -> axum::response::Response {
    match state.supervisor.store.get_agent(&agent_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Agent not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
    match state
        .supervisor
        .analytics
        .agent_metrics(&agent_id, query.days)
        .await
    {
        Ok(metrics) => Json(metrics).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

pub(crate) async fn record_agent_metrics(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(values): Json<MetricValues>,
) -> axum::response::Response {
    match state.supervisor.store.get_agent(&agent_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Agent not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
    match state
        .supervisor
        .analytics
        .record_metrics(&agent_id, &values)
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}
