use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;

use super::super::AppState;
use crate::core::activation::{is_activated, mark_activated};
use crate::core::runner::AgentRunner;
use crate::core::store::types::{AgentStatus, AgentUpdate, now_iso};

fn error_response(status: StatusCode, detail: &str) -> axum::response::Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

pub(crate) async fn list_pending(State(state): State<AppState>) -> axum::response::Response {
    match state.supervisor.store.list_pending_agents().await {
        Ok(rows) => {
            let payload: Vec<_> = rows
                .into_iter()
                .map(|row| {
                    json!({
                        "agent_id": row.agent_id,
                        "display_name": row.display_name.clone().unwrap_or_else(|| row.agent_id.clone()),
                        "bio": row.bio.unwrap_or_default(),
                        "status": row.status.as_str(),
                        "activation_url": row.activation_url,
                        "created_at": row.created_at,
                        "last_checked": row.last_checked,
                        "check_count": row.check_count,
                    })
                })
                .collect();
            Json(payload).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Manual activation probe: same CLI invocation and marker set the
/// activation monitor uses.
pub(crate) async fn check_activation(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> axum::response::Response {
    let store = &state.supervisor.store;
    let agent = match store.get_agent(&agent_id).await {
        Ok(Some(agent))
            if matches!(agent.status, AgentStatus::Waiting | AgentStatus::Pending) =>
        {
            agent
        }
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "Pending agent not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let runner = AgentRunner::new(
        &agent.id,
        state.supervisor.config.clone(),
        store.clone(),
        &state.supervisor.agents_dir,
    );
    let outcome = runner.check_activation_status().await;
    if let Err(e) = store.bump_pending_check(&agent_id).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    if outcome.success
        && let Some(output) = &outcome.output
        && is_activated(output)
    {
        if let Err(e) = mark_activated(store, &state.supervisor.scheduler, &agent_id).await {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
        return Json(json!({
            "agent_id": agent_id,
            "status": "ACTIVE",
            "message": "Agent activated successfully",
            "activated_at": now_iso(),
        }))
        .into_response();
    }

    let check_count = store
        .get_pending(&agent_id)
        .await
        .ok()
        .flatten()
        .map(|row| row.check_count)
        .unwrap_or(0);
    Json(json!({
        "agent_id": agent_id,
        "status": agent.status.as_str(),
        "message": "Agent still pending activation",
        "check_count": check_count,
    }))
    .into_response()
}

/// Abandon the activation wait and return the agent to DESIGN.
pub(crate) async fn cancel_pending(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> axum::response::Response {
    let store = &state.supervisor.store;
    match store.get_agent(&agent_id).await {
        Ok(Some(agent))
            if matches!(agent.status, AgentStatus::Waiting | AgentStatus::Pending) => {}
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "Pending agent not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }

    let update = AgentUpdate {
        status: Some(AgentStatus::Design),
        activation_url: Some(None),
        ..Default::default()
    };
    if let Err(e) = store.update_agent(&agent_id, &update).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    if let Err(e) = store.delete_pending(&agent_id).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    Json(json!({
        "agent_id": agent_id,
        "status": "DESIGN",
        "message": "Pending activation cancelled",
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::super::super::test_support::{request, test_app};
    use crate::core::store::types::{AgentStatus, AgentUpdate};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn listing_and_cancelling_pending_agents() {
        let (app, supervisor, _dir) = test_app().await;
        let (_, created) = request(
            app.clone(),
            "POST",
            "/api/agents",
            Some(serde_json::json!({"name": "pend"})),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();

        // Simulate a finished registration.
        supervisor
            .store
            .update_agent(
                &id,
                &AgentUpdate {
                    status: Some(AgentStatus::Waiting),
                    activation_url: Some(Some(format!("https://x/activate/{id}"))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        supervisor
            .store
            .insert_pending(&id, &format!("https://x/activate/{id}"))
            .await
            .unwrap();

        let (status, listed) = request(app.clone(), "GET", "/api/pending", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["agent_id"], id.as_str());

        let (status, cancelled) =
            request(app.clone(), "DELETE", &format!("/api/pending/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "DESIGN");

        let agent = supervisor.store.get_agent(&id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Design);
        assert!(agent.activation_url.is_none());
        assert!(supervisor.store.get_pending(&id).await.unwrap().is_none());

        // A second cancel finds nothing.
        let (status, _) = request(app, "DELETE", &format!("/api/pending/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn check_requires_a_pending_agent() {
        let (app, _supervisor, _dir) = test_app().await;
        let (_, created) = request(
            app.clone(),
            "POST",
            "/api/agents",
            Some(serde_json::json!({"name": "not-pending"})),
        )
        .await;
        let id = created["id"].as_str().unwrap();

        let (status, _) =
            request(app, "POST", &format!("/api/pending/{id}/check"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
