//! Background polling of agents awaiting human activation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::ConfigHandle;
use crate::core::runner::AgentRunner;
use crate::core::scheduler::HeartbeatScheduler;
use crate::core::store::Store;
use crate::core::store::pending::PendingAgentRow;
use crate::core::store::types::{AgentStatus, AgentUpdate, parse_ts};

/// The one place that knows the CLI's activation markers. Matching is
/// case-insensitive substring search over stdout.
pub fn is_activated(output: &str) -> bool {
    let lowered = output.to_lowercase();
    lowered.contains("\"status\": \"active\"")
        || lowered.contains("status: active")
        || lowered.contains("activated successfully")
}

/// Flip an agent to ACTIVE: stamp, clear pending state, log, and hand it to
/// the scheduler with an immediate first heartbeat.
pub async fn mark_activated(
    store: &Store,
    scheduler: &HeartbeatScheduler,
    agent_id: &str,
) -> Result<()> {
    info!("Agent {agent_id} activated!");
    store
        .update_agent(
            agent_id,
            &AgentUpdate {
                status: Some(AgentStatus::Active),
                activation_url: Some(None),
                ..Default::default()
            },
        )
        .await?;
    store.delete_pending(agent_id).await?;
    store
        .log_activity(agent_id, "activation", "Agent activated by user", true)
        .await?;
    scheduler.add_agent(agent_id, true).await?;
    Ok(())
}

pub struct ActivationMonitor {
    config: ConfigHandle,
    store: Store,
    scheduler: HeartbeatScheduler,
    agents_dir: PathBuf,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActivationMonitor {
    pub fn new(
        config: ConfigHandle,
        store: Store,
        scheduler: HeartbeatScheduler,
        agents_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            scheduler,
            agents_dir,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub async fn start(self: Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("Activation monitor already running");
            return;
        }
        let monitor = self.clone();
        *task = Some(tokio::spawn(async move {
            let cancel = monitor.cancel.clone();
            loop {
                if let Err(e) = monitor.check_all_pending().await {
                    error!("Error in activation monitor: {e:#}");
                }
                let interval = monitor.config.get().activation.check_interval_seconds;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                }
            }
        }));
        info!("Activation monitor started");
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        info!("Activation monitor stopped");
    }

    pub async fn check_all_pending(&self) -> Result<()> {
        for row in self.store.list_pending_agents().await? {
            if let Err(e) = self.check_agent(&row).await {
                error!("Error checking agent {}: {e:#}", row.agent_id);
            }
        }
        Ok(())
    }

    async fn check_agent(&self, row: &PendingAgentRow) -> Result<()> {
        let max_pending_hours = self.config.get().activation.max_pending_hours;
        let expired = parse_ts(&row.created_at)
            .map(|created| {
                Local::now().naive_local() - created > chrono::Duration::hours(max_pending_hours)
            })
            .unwrap_or(false);
        if expired {
            warn!("Agent {} pending too long, cleaning up", row.agent_id);
            self.cleanup_stale_pending(&row.agent_id, max_pending_hours)
                .await?;
            return Ok(());
        }

        let runner = AgentRunner::new(
            &row.agent_id,
            self.config.clone(),
            self.store.clone(),
            &self.agents_dir,
        );
        let outcome = runner.check_activation_status().await;
        self.store.bump_pending_check(&row.agent_id).await?;

        if outcome.success
            && let Some(output) = &outcome.output
            && is_activated(output)
        {
            mark_activated(&self.store, &self.scheduler, &row.agent_id).await?;
        }
        Ok(())
    }

    /// Roll an expired registration back to DESIGN.
    async fn cleanup_stale_pending(&self, agent_id: &str, max_pending_hours: i64) -> Result<()> {
        self.store
            .update_agent(
                agent_id,
                &AgentUpdate {
                    status: Some(AgentStatus::Design),
                    activation_url: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.store.delete_pending(agent_id).await?;
        self.store
            .log_activity(
                agent_id,
                "pending_timeout",
                &format!("Pending activation expired after {max_pending_hours} hours"),
                false,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Config, ConfigHandle};
    use crate::core::heartbeat::HeartbeatManager;
    use crate::core::resources::ResourceMonitor;
    use crate::core::store::test_store;
    use crate::core::store::types::NewAgent;

    #[tokio::test]
    async fn stale_pending_rolls_back_to_design() {
        let (store, dir) = test_store().await;
        store
            .create_agent(&NewAgent {
                id: "aaaa1111".to_string(),
                name: "stale".to_string(),
                display_name: None,
                bio: None,
                ghost_md: "# g".to_string(),
                shell_md: "# s".to_string(),
                site_id: "site_default".to_string(),
                node_id: "node_default".to_string(),
            })
            .await
            .unwrap();
        store
            .update_agent(
                "aaaa1111",
                &AgentUpdate {
                    status: Some(AgentStatus::Waiting),
                    activation_url: Some(Some("https://x/activate/aaaa1111".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .insert_pending("aaaa1111", "https://x/activate/aaaa1111")
            .await
            .unwrap();

        // A zero-hour window expires every pending row immediately, so the
        // CLI probe is never reached.
        let mut config = Config::default();
        config.activation.max_pending_hours = 0;
        let config = ConfigHandle::for_tests(config);
        let agents_dir = dir.path().join("agents");
        let resources = std::sync::Arc::new(ResourceMonitor::new(config.clone()));
        let heartbeats = std::sync::Arc::new(HeartbeatManager::new(
            config.clone(),
            store.clone(),
            agents_dir.clone(),
        ));
        let scheduler = HeartbeatScheduler::new(
            config.clone(),
            store.clone(),
            resources,
            heartbeats,
            agents_dir.clone(),
        )
        .await
        .unwrap();
        let monitor = ActivationMonitor::new(config, store.clone(), scheduler, agents_dir);

        monitor.check_all_pending().await.unwrap();

        let agent = store.get_agent("aaaa1111").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Design);
        assert!(agent.activation_url.is_none());
        assert!(store.get_pending("aaaa1111").await.unwrap().is_none());
        let entries = store.recent_activity("aaaa1111", 10).await.unwrap();
        assert!(entries.iter().any(|e| e.activity_type == "pending_timeout"));
    }

    #[test]
    fn activation_markers_match_the_contract() {
        assert!(is_activated(r#"{"status": "active", "name": "x"}"#));
        assert!(is_activated("STATUS: ACTIVE"));
        assert!(is_activated("Agent was Activated Successfully."));
        assert!(!is_activated(r#"{"status": "pending"}"#));
        assert!(!is_activated("activation pending, visit the url"));
        assert!(!is_activated(""));
    }
}
