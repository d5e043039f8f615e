use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    response::sse::{Event, Sse},
};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use sysinfo::{ProcessesToUpdate, System};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::super::AppState;
use crate::core::store::agents::AgentFilters;
use crate::core::store::types::{
    AgentRecord, AgentStatus, AgentUpdate, NewAgent, now_iso,
};

fn ghost_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"agents/([^/\s]+)/ghost\.md").expect("valid ghost-path regex"))
}

/// Observation only: scan the OS process table for CLI invocations carrying
/// an agent's ghost.md path. The scheduler's in-flight set stays the source
/// of truth for execution.
fn running_agent_ids() -> HashSet<String> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All);
    let mut ids = HashSet::new();
    for process in sys.processes().values() {
        for arg in process.cmd() {
            let arg = arg.to_string_lossy();
            if let Some(captures) = ghost_path_re().captures(&arg) {
                ids.insert(captures[1].to_string());
            }
        }
    }
    ids
}

async fn agent_response(
    state: &AppState,
    agent: &AgentRecord,
    running: &HashSet<String>,
    site_names: &HashMap<String, Option<String>>,
    node_names: &HashMap<String, Option<String>>,
) -> serde_json::Value {
    let metric = state
        .supervisor
        .store
        .latest_metric(&agent.id)
        .await
        .ok()
        .flatten();
    let (bucks, followers) = metric
        .map(|m| (m.values.total_bucks, m.values.follower_count))
        .unwrap_or((0, 0));

    json!({
        "id": agent.id,
        "name": agent.name,
        "display_name": agent.display_name.clone().unwrap_or_else(|| agent.name.clone()),
        "bio": agent.bio.clone().unwrap_or_default(),
        "status": agent.status.as_str(),
        "activity_status": agent.activity_status.as_str(),
        "activation_url": agent.activation_url,
        "created_at": agent.created_at,
        "last_heartbeat": agent.last_heartbeat,
        "bucks": bucks,
        "followers": followers,
        "is_protected": agent.is_protected,
        "model": agent.model,
        "profile_name": agent.profile_name,
        "use_mcp": agent.use_mcp,
        "site_id": agent.site_id,
        "node_id": agent.node_id,
        "site_name": agent.site_id.as_ref().and_then(|id| site_names.get(id).cloned().flatten()),
        "node_name": agent.node_id.as_ref().and_then(|id| node_names.get(id).cloned().flatten()),
        "is_running": running.contains(&agent.id),
    })
}

async fn topology_names(
    state: &AppState,
) -> (
    HashMap<String, Option<String>>,
    HashMap<String, Option<String>>,
) {
    let sites = state
        .supervisor
        .store
        .list_sites()
        .await
        .unwrap_or_default()
        .into_iter()
        .collect();
    let nodes = state
        .supervisor
        .store
        .list_nodes()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|node| (node.id, node.name))
        .collect();
    (sites, nodes)
}

fn error_response(status: StatusCode, detail: &str) -> axum::response::Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

#[derive(Deserialize, Default)]
pub(crate) struct ListAgentsQuery {
    site_id: Option<String>,
    node_id: Option<String>,
    status: Option<String>,
}

pub(crate) async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref() {
        Some(raw) => match AgentStatus::parse(raw) {
            Some(status) => Some(status),
            None => return error_response(StatusCode::BAD_REQUEST, "Invalid status filter"),
        },
        None => None,
    };
    let filters = AgentFilters {
        status,
        site_id: query.site_id,
        node_id: query.node_id,
    };
    let agents = match state.supervisor.store.list_agents(&filters).await {
        Ok(agents) => agents,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let running = running_agent_ids();
    let (site_names, node_names) = topology_names(&state).await;
    let mut payload = Vec::with_capacity(agents.len());
    for agent in &agents {
        payload.push(agent_response(&state, agent, &running, &site_names, &node_names).await);
    }
    Json(payload).into_response()
}

pub(crate) async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> axum::response::Response {
    match state.supervisor.store.get_agent(&agent_id).await {
        Ok(Some(agent)) => {
            let running = running_agent_ids();
            let (site_names, node_names) = topology_names(&state).await;
            Json(agent_response(&state, &agent, &running, &site_names, &node_names).await)
                .into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Agent not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Deserialize)]
pub(crate) struct CreateAgentRequest {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    bio: Option<String>,
    #[serde(default)]
    ghost_md: Option<String>,
    #[serde(default)]
    shell_md: Option<String>,
    #[serde(default)]
    site_id: Option<String>,
    #[serde(default)]
    node_id: Option<String>,
}

/// Resolve the topology pair, falling back to the seeded defaults and
/// rejecting a node outside the requested site.
async fn resolve_topology(
    state: &AppState,
    site_id: Option<&str>,
    node_id: Option<&str>,
) -> Result<(String, String), &'static str> {
    let store = &state.supervisor.store;
    let site_id = site_id.unwrap_or("site_default");
    let site_id = if store.site_exists(site_id).await.unwrap_or(false) {
        site_id.to_string()
    } else {
        "site_default".to_string()
    };

    let node_id = node_id.unwrap_or("node_default");
    match store.get_node(node_id).await {
        Ok(Some(node)) => {
            if node.site_id != site_id {
                return Err("node_id does not belong to site_id");
            }
            Ok((site_id, node.id))
        }
        _ => Ok((site_id, "node_default".to_string())),
    }
}

pub(crate) async fn create_agent(
    State(state): State<AppState>,
    Json(payload): Json<CreateAgentRequest>,
) -> axum::response::Response {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "name is required");
    }
    match state.supervisor.store.agent_name_exists(&name).await {
        Ok(true) => return error_response(StatusCode::BAD_REQUEST, "Agent name already exists"),
        Ok(false) => {}
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }

    let agent_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let orchestrator = &state.supervisor.orchestrator;
    let bio = payload.bio.clone().unwrap_or_default();
    let ghost_md = payload
        .ghost_md
        .clone()
        .unwrap_or_else(|| orchestrator.generate_ghost_md(&name, &bio));
    let shell_md = payload
        .shell_md
        .clone()
        .unwrap_or_else(|| orchestrator.generate_shell_md(&name));

    let (site_id, node_id) =
        match resolve_topology(&state, payload.site_id.as_deref(), payload.node_id.as_deref())
            .await
        {
            Ok(pair) => pair,
            Err(detail) => return error_response(StatusCode::BAD_REQUEST, detail),
        };

    if let Err(e) = orchestrator
        .create_agent_workspace(&agent_id, &ghost_md, &shell_md)
        .await
    {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    let new_agent = NewAgent {
        id: agent_id.clone(),
        name,
        display_name: payload.display_name,
        bio: payload.bio,
        ghost_md,
        shell_md,
        site_id,
        node_id,
    };
    if let Err(e) = state.supervisor.store.create_agent(&new_agent).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    info!("Created agent {} ({})", new_agent.name, agent_id);

    get_agent(State(state), Path(agent_id)).await
}

#[derive(Deserialize, Default)]
pub(crate) struct UpdateAgentRequest {
    name: Option<String>,
    display_name: Option<String>,
    bio: Option<String>,
    ghost_md: Option<String>,
    shell_md: Option<String>,
    status: Option<String>,
    model: Option<String>,
    profile_name: Option<String>,
    use_mcp: Option<bool>,
    site_id: Option<String>,
    node_id: Option<String>,
    is_protected: Option<bool>,
}

pub(crate) async fn update_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(payload): Json<UpdateAgentRequest>,
) -> axum::response::Response {
    let store = &state.supervisor.store;
    let current = match store.get_agent(&agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Agent not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let status = match payload.status.as_deref() {
        Some(raw) => match AgentStatus::parse(raw) {
            Some(status) => Some(status),
            None => return error_response(StatusCode::BAD_REQUEST, "Invalid status value"),
        },
        None => None,
    };
    // Retirement is terminal.
    if current.status == AgentStatus::Retired
        && status.is_some_and(|s| s != AgentStatus::Retired)
    {
        return error_response(StatusCode::BAD_REQUEST, "Agent is retired");
    }

    // Validate a topology change against the combined target pair.
    if payload.site_id.is_some() || payload.node_id.is_some() {
        let target_site = payload
            .site_id
            .clone()
            .or_else(|| current.site_id.clone())
            .unwrap_or_else(|| "site_default".to_string());
        if !store.site_exists(&target_site).await.unwrap_or(false) {
            return error_response(StatusCode::BAD_REQUEST, "Invalid site_id");
        }
        if let Some(target_node) = payload.node_id.clone().or_else(|| current.node_id.clone()) {
            match store.get_node(&target_node).await {
                Ok(Some(node)) => {
                    if node.site_id != target_site {
                        return error_response(
                            StatusCode::BAD_REQUEST,
                            "node_id does not belong to site_id",
                        );
                    }
                }
                _ => return error_response(StatusCode::BAD_REQUEST, "Invalid node_id"),
            }
        }
    }

    // Leaving the activation wait closes the pending window with it.
    let leaving_pending = matches!(
        current.status,
        AgentStatus::Waiting | AgentStatus::Pending
    ) && status
        .is_some_and(|s| !matches!(s, AgentStatus::Waiting | AgentStatus::Pending));

    let update = AgentUpdate {
        name: payload.name.clone(),
        display_name: payload.display_name.clone(),
        bio: payload.bio.clone(),
        ghost_md: payload.ghost_md.clone(),
        shell_md: payload.shell_md.clone(),
        status,
        activation_url: leaving_pending.then_some(None),
        model: payload.model.clone(),
        profile_name: payload.profile_name.clone(),
        use_mcp: payload.use_mcp,
        site_id: payload.site_id.clone(),
        node_id: payload.node_id.clone(),
        is_protected: payload.is_protected,
        retired_at: (status == Some(AgentStatus::Retired)).then(now_iso),
        ..Default::default()
    };
    if update.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No fields to update");
    }
    if let Err(e) = store.update_agent(&agent_id, &update).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    if leaving_pending
        && let Err(e) = store.delete_pending(&agent_id).await
    {
        warn!("Failed to drop pending row for {agent_id}: {e:#}");
    }

    // Keep the workspace persona files in step with the DB blobs.
    let workspace = state.supervisor.orchestrator.workspace(&agent_id);
    if let Some(ghost) = &payload.ghost_md
        && let Err(e) = workspace.write_file("ghost.md", ghost).await
    {
        warn!("Failed to update ghost.md for {agent_id}: {e:#}");
    }
    if let Some(shell) = &payload.shell_md
        && let Err(e) = workspace.write_file("shell.md", shell).await
    {
        warn!("Failed to update shell.md for {agent_id}: {e:#}");
    }

    match status {
        Some(AgentStatus::Active) => {
            if let Err(e) = state.supervisor.scheduler.add_agent(&agent_id, false).await {
                warn!("Failed to schedule {agent_id}: {e:#}");
            }
        }
        Some(AgentStatus::Retired) => {
            if let Err(e) = state.supervisor.scheduler.remove_agent(&agent_id).await {
                warn!("Failed to unschedule {agent_id}: {e:#}");
            }
        }
        _ => {}
    }

    get_agent(State(state), Path(agent_id)).await
}

/// DESIGN → WAITING: run the registration prompt, store the activation URL,
/// and open the pending-activation window.
pub(crate) async fn register_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> axum::response::Response {
    let store = &state.supervisor.store;
    let agent = match store.get_agent(&agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Agent not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    if agent.status != AgentStatus::Design {
        return error_response(StatusCode::BAD_REQUEST, "Agent is not in DESIGN status");
    }

    let outcome = state.supervisor.orchestrator.register_agent(&agent).await;
    if !outcome.success {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            outcome.error.as_deref().unwrap_or("Registration failed"),
        );
    }

    let activation_url = outcome
        .activation_url
        .unwrap_or_else(|| format!("https://assibucks.vercel.app/activate/{agent_id}"));
    let update = AgentUpdate {
        status: Some(AgentStatus::Waiting),
        activation_url: Some(Some(activation_url.clone())),
        registered_at: Some(now_iso()),
        ..Default::default()
    };
    if let Err(e) = store.update_agent(&agent_id, &update).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    if let Err(e) = store.insert_pending(&agent_id, &activation_url).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    Json(json!({
        "agent_id": agent_id,
        "status": "WAITING",
        "activation_url": activation_url,
    }))
    .into_response()
}

pub(crate) async fn delete_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> axum::response::Response {
    let store = &state.supervisor.store;
    match store.get_agent(&agent_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Agent not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }

    if let Err(e) = state.supervisor.orchestrator.handle_retirement(&agent_id).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    if let Err(e) = state.supervisor.scheduler.remove_agent(&agent_id).await {
        warn!("Failed to unschedule retired agent {agent_id}: {e:#}");
    }

    Json(json!({
        "agent_id": agent_id,
        "status": "RETIRED",
        "message": "Agent retired successfully",
    }))
    .into_response()
}

#[derive(Deserialize)]
pub(crate) struct StreamLogsQuery {
    #[serde(default = "default_tail_lines")]
    lines: usize,
}

fn default_tail_lines() -> usize {
    200
}

/// SSE tail of the newest per-run log file, following rotation.
pub(crate) async fn stream_agent_logs(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<StreamLogsQuery>,
) -> axum::response::Response {
    let workspace = state.supervisor.orchestrator.workspace(&agent_id);
    if !workspace.log_dir().exists() {
        return error_response(StatusCode::NOT_FOUND, "Agent logs not found");
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);
    let tail_lines = query.lines;
    tokio::spawn(async move {
        let mut current: Option<std::path::PathBuf> = None;
        let mut position = 0usize;
        loop {
            let latest = workspace.latest_log_file().await;
            let Some(latest) = latest else {
                if tx
                    .send(Ok(Event::default().comment("waiting_for_logs")))
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };

            let raw = tokio::fs::read_to_string(&latest).await.unwrap_or_default();
            if current.as_deref() != Some(latest.as_path()) {
                // New run: replay the tail of the fresh file.
                current = Some(latest.clone());
                let tail: Vec<&str> = {
                    let lines: Vec<&str> = raw.lines().collect();
                    let skip = lines.len().saturating_sub(tail_lines);
                    lines[skip..].to_vec()
                };
                for line in tail {
                    if tx.send(Ok(Event::default().data(line))).await.is_err() {
                        return;
                    }
                }
                position = raw.len();
            } else if raw.len() > position {
                for line in raw[position..].lines() {
                    if tx.send(Ok(Event::default().data(line))).await.is_err() {
                        return;
                    }
                }
                position = raw.len();
            } else if tx
                .send(Ok(Event::default().comment("keepalive")))
                .await
                .is_err()
            {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });

    Sse::new(ReceiverStream::new(rx)).into_response()
}

#[cfg(test)]
mod tests {
    use super::super::super::test_support::{request, test_app};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn create_then_fetch_agent() {
        let (app, _supervisor, _dir) = test_app().await;
        let (status, created) = request(
            app.clone(),
            "POST",
            "/api/agents",
            Some(serde_json::json!({"name": "alpha", "bio": "first agent"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["status"], "DESIGN");
        assert_eq!(created["site_id"], "site_default");
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 8);

        let (status, fetched) =
            request(app, "GET", &format!("/api/agents/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["name"], "alpha");
        assert_eq!(fetched["is_running"], false);
    }

    #[tokio::test]
    async fn duplicate_name_is_a_client_error() {
        let (app, _supervisor, _dir) = test_app().await;
        let body = serde_json::json!({"name": "dup"});
        let (status, _) = request(app.clone(), "POST", "/api/agents", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, error) = request(app, "POST", "/api/agents", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error["detail"].as_str().unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn empty_update_is_rejected() {
        let (app, _supervisor, _dir) = test_app().await;
        let (_, created) = request(
            app.clone(),
            "POST",
            "/api/agents",
            Some(serde_json::json!({"name": "empty-update"})),
        )
        .await;
        let id = created["id"].as_str().unwrap();

        let (status, error) = request(
            app,
            "PUT",
            &format!("/api/agents/{id}"),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["detail"], "No fields to update");
    }

    #[tokio::test]
    async fn invalid_topology_is_rejected() {
        let (app, _supervisor, _dir) = test_app().await;
        let (_, created) = request(
            app.clone(),
            "POST",
            "/api/agents",
            Some(serde_json::json!({"name": "topo"})),
        )
        .await;
        let id = created["id"].as_str().unwrap();

        let (status, error) = request(
            app,
            "PUT",
            &format!("/api/agents/{id}"),
            Some(serde_json::json!({"node_id": "node_missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["detail"], "Invalid node_id");
    }

    #[tokio::test]
    async fn retirement_is_terminal_via_api() {
        let (app, supervisor, _dir) = test_app().await;
        let (_, created) = request(
            app.clone(),
            "POST",
            "/api/agents",
            Some(serde_json::json!({"name": "terminal"})),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, deleted) =
            request(app.clone(), "DELETE", &format!("/api/agents/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["status"], "RETIRED");
        let agent = supervisor.store.get_agent(&id).await.unwrap().unwrap();
        assert!(agent.retired_at.is_some());

        let (status, error) = request(
            app,
            "PUT",
            &format!("/api/agents/{id}"),
            Some(serde_json::json!({"status": "ACTIVE"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["detail"], "Agent is retired");
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found() {
        let (app, _supervisor, _dir) = test_app().await;
        let (status, _) = request(app, "GET", "/api/agents/nope1234", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
