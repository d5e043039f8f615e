//! Agent lifecycle plumbing: workspace provisioning, registration against
//! the external service, protection rules, retirement.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use tracing::info;

use crate::core::config::ConfigHandle;
use crate::core::runner::AgentRunner;
use crate::core::store::Store;
use crate::core::store::types::{AgentRecord, AgentStatus, AgentUpdate, now_iso};
use crate::core::workspace::AgentWorkspace;

fn activation_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"https?://[^\s"']+activate[^\s"']*"#).expect("valid activation-url regex")
    })
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub success: bool,
    pub activation_url: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: ConfigHandle,
    store: Store,
    agents_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(config: ConfigHandle, store: Store, agents_dir: PathBuf) -> Self {
        Self {
            config,
            store,
            agents_dir,
        }
    }

    pub fn workspace(&self, agent_id: &str) -> AgentWorkspace {
        AgentWorkspace::new(&self.agents_dir, agent_id)
    }

    pub async fn create_agent_workspace(
        &self,
        agent_id: &str,
        ghost_md: &str,
        shell_md: &str,
    ) -> Result<AgentWorkspace> {
        let workspace = self.workspace(agent_id);
        workspace.provision(ghost_md, shell_md).await?;
        Ok(workspace)
    }

    /// Persona fallbacks when the caller supplies none. Rendering a rich
    /// persona from templates is the factory's job, not the supervisor's.
    pub fn generate_ghost_md(&self, name: &str, bio: &str) -> String {
        format!("# ghost.md - {name}\n\n{bio}")
    }

    pub fn generate_shell_md(&self, name: &str) -> String {
        format!(
            "# shell.md - {name}\n\nSkill URL: {}",
            self.config.get().loop_cfg.skill_url
        )
    }

    /// Run the registration prompt through the CLI and pull the activation
    /// URL out of its output when present.
    pub async fn register_agent(&self, agent: &AgentRecord) -> RegistrationOutcome {
        let runner = AgentRunner::new(
            &agent.id,
            self.config.clone(),
            self.store.clone(),
            &self.agents_dir,
        );
        let outcome = runner.run_registration(agent).await;

        let activation_url = outcome
            .output
            .as_deref()
            .filter(|output| output.to_lowercase().contains("activation_url"))
            .and_then(|output| activation_url_re().find(output))
            .map(|found| found.as_str().to_string());

        RegistrationOutcome {
            success: outcome.success,
            activation_url,
            error: outcome.error,
        }
    }

    /// Effective protection: the explicit flag, or earned thresholds on the
    /// latest metric.
    pub async fn is_agent_protected(&self, agent_id: &str) -> Result<bool> {
        if let Some(agent) = self.store.get_agent(agent_id).await?
            && agent.is_protected
        {
            return Ok(true);
        }

        let protection = self.config.get().activity_monitoring.protection;
        if let Some(metric) = self.store.latest_metric(agent_id).await? {
            if metric.values.total_bucks > protection.high_bucks_threshold {
                return Ok(true);
            }
            if metric.values.follower_count > protection.high_follower_threshold {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Retirement is terminal: stamp, drop the schedule row, done.
    pub async fn handle_retirement(&self, agent_id: &str) -> Result<()> {
        self.store
            .update_agent(
                agent_id,
                &AgentUpdate {
                    status: Some(AgentStatus::Retired),
                    retired_at: Some(now_iso()),
                    ..Default::default()
                },
            )
            .await?;
        self.store.delete_schedule(agent_id).await?;
        info!("Agent {agent_id} retired");
        Ok(())
    }
}
