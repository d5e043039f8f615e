use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Local;
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use crate::core::activity::{prompt_types, reactivation_prompt};
use crate::core::runner::AgentRunner;
use crate::core::store::types::{AgentStatus, AgentUpdate, parse_ts};

fn error_response(status: StatusCode, detail: &str) -> axum::response::Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

pub(crate) async fn get_summary(State(state): State<AppState>) -> axum::response::Response {
    match state.supervisor.activity.activity_summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

pub(crate) async fn get_alerts(State(state): State<AppState>) -> axum::response::Response {
    match state.supervisor.activity.alerts().await {
        Ok(alerts) => Json(alerts).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

pub(crate) async fn get_agent_activity(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> axum::response::Response {
    let store = &state.supervisor.store;
    let agent = match store.get_agent(&agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Agent not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let activity_status = state.supervisor.activity.activity_status(&agent).await;
    let recent = match store.recent_activity(&agent_id, 20).await {
        Ok(entries) => entries,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    Json(json!({
        "agent_id": agent_id,
        "display_name": agent.display_name,
        "status": agent.status.as_str(),
        "activity_status": activity_status.as_str(),
        "last_heartbeat": agent.last_heartbeat,
        "is_protected": agent.is_protected,
        "recent_logs": recent,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub(crate) struct PromptQuery {
    #[serde(default = "default_prompt_type")]
    prompt_type: String,
}

fn default_prompt_type() -> String {
    "idle".to_string()
}

/// Manually fire a reactivation prompt, bypassing the monitor's cooldown.
pub(crate) async fn send_prompt(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<PromptQuery>,
) -> axum::response::Response {
    match state.supervisor.store.get_agent(&agent_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Agent not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
    let Some(prompt) = reactivation_prompt(&query.prompt_type) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid prompt type. Choose from: {:?}", prompt_types()),
        );
    };

    let runner = AgentRunner::new(
        &agent_id,
        state.supervisor.config.clone(),
        state.supervisor.store.clone(),
        &state.supervisor.agents_dir,
    );
    let outcome = runner.run_with_prompt(prompt).await;

    Json(json!({
        "agent_id": agent_id,
        "prompt_type": query.prompt_type,
        "success": outcome.success,
        "message": if outcome.success {
            "Reactivation prompt sent"
        } else {
            "Failed to send prompt"
        },
    }))
    .into_response()
}

pub(crate) async fn toggle_protection(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> axum::response::Response {
    let store = &state.supervisor.store;
    let agent = match store.get_agent(&agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Agent not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let flipped = !agent.is_protected;
    let update = AgentUpdate {
        is_protected: Some(flipped),
        ..Default::default()
    };
    if let Err(e) = store.update_agent(&agent_id, &update).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    Json(json!({
        "agent_id": agent_id,
        "is_protected": flipped,
        "message": if flipped { "Protection enabled" } else { "Protection disabled" },
    }))
    .into_response()
}

/// Agents drifting toward the auto-retire horizon, with a six-hour warning
/// window.
pub(crate) async fn get_retirements(State(state): State<AppState>) -> axum::response::Response {
    let config = state.supervisor.config.get();
    let horizon_hours = config.activity_monitoring.auto_retire_inactive_hours;
    let warn_after = Local::now().naive_local() - chrono::Duration::hours(horizon_hours - 6);
    let now = Local::now().naive_local();

    let store = &state.supervisor.store;
    let mut agents = match store.agents_with_status(AgentStatus::Active).await {
        Ok(agents) => agents,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    match store.agents_with_status(AgentStatus::Probation).await {
        Ok(probation) => agents.extend(probation),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }

    let mut upcoming = Vec::new();
    for agent in agents {
        if agent.is_protected {
            continue;
        }
        let Some(last) = agent.last_heartbeat.as_deref().and_then(parse_ts) else {
            continue;
        };
        if last >= warn_after {
            continue;
        }
        let hours_until =
            horizon_hours as f64 - (now - last).num_seconds() as f64 / 3600.0;
        upcoming.push(json!({
            "id": agent.id,
            "display_name": agent.display_name,
            "last_heartbeat": agent.last_heartbeat,
            "is_protected": agent.is_protected,
            "hours_until_retirement": (hours_until.max(0.0) * 10.0).round() / 10.0,
        }));
    }
    Json(upcoming).into_response()
}

#[cfg(test)]
mod tests {
    use super::super::super::test_support::{request, test_app};
    use crate::core::store::types::{AgentStatus, AgentUpdate, now_iso};
    use axum::http::StatusCode;

    async fn active_agent(app: &axum::Router, supervisor: &crate::core::supervisor::Supervisor, name: &str) -> String {
        let (_, created) = request(
            app.clone(),
            "POST",
            "/api/agents",
            Some(serde_json::json!({"name": name})),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();
        supervisor
            .store
            .update_agent(
                &id,
                &AgentUpdate {
                    status: Some(AgentStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn summary_counts_fresh_and_stale_agents() {
        let (app, supervisor, _dir) = test_app().await;
        let fresh = active_agent(&app, &supervisor, "fresh").await;
        let stale = active_agent(&app, &supervisor, "stale").await;

        supervisor
            .store
            .set_last_heartbeat(&fresh, &now_iso())
            .await
            .unwrap();
        supervisor
            .store
            .set_last_heartbeat(&stale, "2020-01-01T00:00:00")
            .await
            .unwrap();

        let (status, summary) = request(app, "GET", "/api/activity/summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["healthy_count"], 1);
        assert_eq!(summary["critical_count"], 1);
    }

    #[tokio::test]
    async fn alerts_skip_healthy_agents() {
        let (app, supervisor, _dir) = test_app().await;
        let fresh = active_agent(&app, &supervisor, "ok").await;
        let stale = active_agent(&app, &supervisor, "bad").await;
        supervisor
            .store
            .set_last_heartbeat(&fresh, &now_iso())
            .await
            .unwrap();
        supervisor
            .store
            .set_last_heartbeat(&stale, "2020-01-01T00:00:00")
            .await
            .unwrap();

        let (status, alerts) = request(app, "GET", "/api/activity/alerts", None).await;
        assert_eq!(status, StatusCode::OK);
        let alerts = alerts.as_array().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["agent_id"], stale.as_str());
        assert_eq!(alerts[0]["status"], "CRITICAL");
    }

    #[tokio::test]
    async fn protection_toggles_back_and_forth() {
        let (app, supervisor, _dir) = test_app().await;
        let id = active_agent(&app, &supervisor, "guard").await;

        let uri = format!("/api/activity/agents/{id}/protect");
        let (_, first) = request(app.clone(), "POST", &uri, None).await;
        assert_eq!(first["is_protected"], true);
        let (_, second) = request(app, "POST", &uri, None).await;
        assert_eq!(second["is_protected"], false);
    }

    #[tokio::test]
    async fn invalid_prompt_type_is_rejected() {
        let (app, supervisor, _dir) = test_app().await;
        let id = active_agent(&app, &supervisor, "prompted").await;
        let (status, _) = request(
            app,
            "POST",
            &format!("/api/activity/agents/{id}/prompt?prompt_type=bogus"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn retirements_list_only_unprotected_stale_agents() {
        let (app, supervisor, _dir) = test_app().await;
        let stale = active_agent(&app, &supervisor, "stale-unprot").await;
        let shielded = active_agent(&app, &supervisor, "stale-prot").await;
        supervisor
            .store
            .set_last_heartbeat(&stale, "2020-01-01T00:00:00")
            .await
            .unwrap();
        supervisor
            .store
            .set_last_heartbeat(&shielded, "2020-01-01T00:00:00")
            .await
            .unwrap();
        supervisor
            .store
            .update_agent(
                &shielded,
                &AgentUpdate {
                    is_protected: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (status, listed) = request(app, "GET", "/api/activity/retirements", None).await;
        assert_eq!(status, StatusCode::OK);
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], stale.as_str());
        assert_eq!(listed[0]["hours_until_retirement"], 0.0);
    }
}
