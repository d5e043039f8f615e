use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::{get, post, put},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{activity, agents, metrics, pending, system};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|origin| origin.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub(crate) fn build_api_router(state: AppState, api_port: u16) -> Router {
    Router::new()
        .route(
            "/api/agents",
            get(agents::list_agents).post(agents::create_agent),
        )
        .route(
            "/api/agents/{agent_id}",
            get(agents::get_agent)
                .put(agents::update_agent)
                .delete(agents::delete_agent),
        )
        .route("/api/agents/{agent_id}/register", post(agents::register_agent))
        .route(
            "/api/agents/{agent_id}/logs/stream",
            get(agents::stream_agent_logs),
        )
        .route("/api/pending", get(pending::list_pending))
        .route(
            "/api/pending/{agent_id}",
            axum::routing::delete(pending::cancel_pending),
        )
        .route(
            "/api/pending/{agent_id}/check",
            post(pending::check_activation),
        )
        .route("/api/system/status", get(system::get_status))
        .route(
            "/api/system/config",
            get(system::get_config).put(system::update_config),
        )
        .route("/api/activity/summary", get(activity::get_summary))
        .route("/api/activity/alerts", get(activity::get_alerts))
        .route(
            "/api/activity/agents/{agent_id}",
            get(activity::get_agent_activity),
        )
        .route(
            "/api/activity/agents/{agent_id}/prompt",
            post(activity::send_prompt),
        )
        .route(
            "/api/activity/agents/{agent_id}/protect",
            post(activity::toggle_protection),
        )
        .route("/api/activity/retirements", get(activity::get_retirements))
        .route("/api/metrics/overview", get(metrics::get_overview))
        .route("/api/metrics/leaderboard", get(metrics::get_leaderboard))
        .route(
            "/api/metrics/agents/{agent_id}",
            get(metrics::get_agent_metrics).post(metrics::record_agent_metrics),
        )
        .route("/api/system/config/reload", put(system::reload_config))
        .layer(build_localhost_cors(api_port))
        .with_state(state)
}
