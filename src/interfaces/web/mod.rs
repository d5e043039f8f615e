//! Thin HTTP facade over the supervisor core.

mod handlers;
mod router;

use anyhow::Result;
use tracing::info;

use crate::core::supervisor::Supervisor;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) supervisor: Supervisor,
}

pub struct ApiServer {
    supervisor: Supervisor,
    api_host: String,
    api_port: u16,
}

impl ApiServer {
    pub fn new(supervisor: Supervisor, api_host: String, api_port: u16) -> Self {
        Self {
            supervisor,
            api_host,
            api_port,
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let state = AppState {
            supervisor: self.supervisor,
        };
        let app = router::build_api_router(state, self.api_port);
        let addr = format!("{}:{}", self.api_host, self.api_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("API listening on http://{addr}");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::AppState;
    use crate::core::config::ConfigHandle;
    use crate::core::supervisor::Supervisor;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    /// Drive one request through the router and decode the JSON body.
    pub(crate) async fn request(
        app: axum::Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    /// Router + supervisor over a throwaway home dir for handler tests.
    pub(crate) async fn test_app() -> (axum::Router, Supervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp home");
        let config =
            ConfigHandle::load(dir.path().join("config.yaml")).expect("load default config");
        let supervisor = Supervisor::build_with_config(dir.path(), config)
            .await
            .expect("build supervisor");
        let router = super::router::build_api_router(
            AppState {
                supervisor: supervisor.clone(),
            },
            0,
        );
        (router, supervisor, dir)
    }
}
