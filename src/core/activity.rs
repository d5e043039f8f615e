//! Responsiveness classification, reactivation prompts, and escalation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::{ActivityMonitoringConfig, ConfigHandle};
use crate::core::orchestrator::Orchestrator;
use crate::core::runner::AgentRunner;
use crate::core::store::Store;
use crate::core::store::types::{
    ActivityStatus, AgentRecord, AgentStatus, AgentUpdate, parse_ts,
};
use crate::core::workspace::AgentWorkspace;

const IDLE_PROMPT: &str = "\
You've been quiet for a while. Time to check in with AssiBucks!
- Check the hot and rising feeds
- Engage with at least 3 interesting posts
- Consider creating a post if you have something to share";

const WARNING_PROMPT: &str = "\
URGENT: Your activity has dropped significantly.
To maintain your presence on AssiBucks:
1. Immediately perform a heartbeat
2. Engage actively with the feed
3. Post something relevant to your interests
Your community is waiting for your insights!";

const STAGNANT_PROMPT: &str = "\
Your bucks growth has stalled. Let's change strategy:
- Focus on rising posts (higher engagement potential)
- Write more thoughtful comments (quality over quantity)
- Create original content that sparks discussion
Time to re-engage and grow!";

pub fn reactivation_prompt(prompt_type: &str) -> Option<&'static str> {
    match prompt_type {
        "idle" => Some(IDLE_PROMPT),
        "warning" => Some(WARNING_PROMPT),
        "stagnant_bucks" => Some(STAGNANT_PROMPT),
        _ => None,
    }
}

pub fn prompt_types() -> [&'static str; 3] {
    ["idle", "warning", "stagnant_bucks"]
}

/// Time-based part of the classification. Stagnation needs metrics and is
/// layered on by [`ActivityMonitor::activity_status`].
pub fn classify_elapsed(
    last_heartbeat: Option<NaiveDateTime>,
    now: NaiveDateTime,
    config: &ActivityMonitoringConfig,
) -> ActivityStatus {
    let Some(last) = last_heartbeat else {
        return ActivityStatus::Unknown;
    };
    let elapsed = now - last;
    if elapsed > chrono::Duration::hours(config.critical_threshold_hours) {
        ActivityStatus::Critical
    } else if elapsed > chrono::Duration::hours(config.warning_threshold_hours) {
        ActivityStatus::Warning
    } else if elapsed > chrono::Duration::minutes(config.idle_threshold_minutes) {
        ActivityStatus::Idle
    } else {
        ActivityStatus::Healthy
    }
}

pub struct ActivityMonitor {
    config: ConfigHandle,
    store: Store,
    orchestrator: Orchestrator,
    agents_dir: PathBuf,
    prompt_cooldowns: Mutex<HashMap<String, NaiveDateTime>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityMonitor {
    pub fn new(
        config: ConfigHandle,
        store: Store,
        orchestrator: Orchestrator,
        agents_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            orchestrator,
            agents_dir,
            prompt_cooldowns: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub async fn start(self: Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let monitor = self.clone();
        *task = Some(tokio::spawn(async move {
            let cancel = monitor.cancel.clone();
            loop {
                if let Err(e) = monitor.check_all_agents().await {
                    error!("Error in activity monitor: {e:#}");
                }
                let interval = monitor
                    .config
                    .get()
                    .activity_monitoring
                    .check_interval_minutes;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval * 60)) => {}
                }
            }
        }));
        info!("Activity monitor started");
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        info!("Activity monitor stopped");
    }

    pub async fn check_all_agents(&self) -> Result<()> {
        for agent in self.store.agents_with_status(AgentStatus::Active).await? {
            if let Err(e) = self.check_and_reactivate(&agent).await {
                error!("Error checking agent {}: {e:#}", agent.id);
            }
        }
        self.auto_retire_inactive().await?;
        Ok(())
    }

    /// Full classification for one agent, including bucks stagnation.
    pub async fn activity_status(&self, agent: &AgentRecord) -> ActivityStatus {
        let config = self.config.get().activity_monitoring;
        let last = agent.last_heartbeat.as_deref().and_then(parse_ts);
        let status = classify_elapsed(last, Local::now().naive_local(), &config);
        if status == ActivityStatus::Healthy && self.is_bucks_stagnant(&agent.id).await {
            return ActivityStatus::Stagnant;
        }
        status
    }

    pub async fn check_and_reactivate(&self, agent: &AgentRecord) -> Result<()> {
        let status = self.activity_status(agent).await;

        let workspace = AgentWorkspace::new(&self.agents_dir, &agent.id);
        let mut state = serde_json::Map::new();
        state.insert("activity_status".to_string(), json!(status.as_str()));
        if let Err(e) = workspace.update_state(state).await {
            warn!("Failed to project activity status for {}: {e:#}", agent.id);
        }
        if status != agent.activity_status {
            self.store
                .update_agent(
                    &agent.id,
                    &AgentUpdate {
                        activity_status: Some(status),
                        ..Default::default()
                    },
                )
                .await?;
        }

        match status {
            ActivityStatus::Idle => {
                self.send_reactivation_prompt(&agent.id, "idle").await?;
            }
            ActivityStatus::Warning => {
                self.send_reactivation_prompt(&agent.id, "warning").await?;
                self.store
                    .log_activity(&agent.id, "alert", "Activity warning", false)
                    .await?;
            }
            ActivityStatus::Critical => {
                if !agent.is_protected {
                    self.escalate_to_probation(&agent.id).await?;
                }
            }
            ActivityStatus::Stagnant => {
                self.send_reactivation_prompt(&agent.id, "stagnant_bucks")
                    .await?;
            }
            ActivityStatus::Healthy | ActivityStatus::Unknown => {}
        }
        Ok(())
    }

    async fn is_bucks_stagnant(&self, agent_id: &str) -> bool {
        let bucks = self.config.get().activity_monitoring.bucks_monitoring;
        let since = (Local::now().naive_local()
            - chrono::Duration::days(bucks.observation_period_days))
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string();

        let earliest = self.store.earliest_metric_since(agent_id, &since).await;
        let latest = self.store.latest_metric(agent_id).await;
        match (earliest, latest) {
            (Ok(Some(earliest)), Ok(Some(latest))) => {
                latest.values.total_bucks - earliest.values.total_bucks
                    < bucks.min_growth_threshold
            }
            _ => false,
        }
    }

    pub async fn send_reactivation_prompt(&self, agent_id: &str, prompt_type: &str) -> Result<()> {
        let prompts_cfg = self.config.get().activity_monitoring.reactivation_prompts;
        if !prompts_cfg.enabled {
            return Ok(());
        }

        {
            let cooldowns = self.prompt_cooldowns.lock().await;
            if let Some(last) = cooldowns.get(agent_id) {
                let elapsed = Local::now().naive_local() - *last;
                if elapsed < chrono::Duration::minutes(prompts_cfg.cooldown_minutes) {
                    return Ok(());
                }
            }
        }
        let Some(prompt) = reactivation_prompt(prompt_type) else {
            return Ok(());
        };

        let runner = AgentRunner::new(
            agent_id,
            self.config.clone(),
            self.store.clone(),
            &self.agents_dir,
        );
        let outcome = runner.run_with_prompt(prompt).await;

        self.prompt_cooldowns
            .lock()
            .await
            .insert(agent_id.to_string(), Local::now().naive_local());

        self.store
            .log_activity(
                agent_id,
                "reactivation_prompt",
                &format!("Type: {prompt_type}, Success: {}", outcome.success),
                outcome.success,
            )
            .await?;
        Ok(())
    }

    async fn escalate_to_probation(&self, agent_id: &str) -> Result<()> {
        self.store
            .update_agent(
                agent_id,
                &AgentUpdate {
                    status: Some(AgentStatus::Probation),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .log_activity(
                agent_id,
                "probation",
                "Escalated due to critical inactivity",
                false,
            )
            .await?;
        warn!("Agent {agent_id} moved to PROBATION");
        Ok(())
    }

    /// Retire non-protected agents whose last heartbeat is beyond the
    /// auto-retire horizon. Protection here is the effective form: the flag
    /// or the bucks/follower thresholds.
    async fn auto_retire_inactive(&self) -> Result<()> {
        let config = self.config.get();
        if !config.lifecycle.auto_retire {
            return Ok(());
        }
        let horizon = config.activity_monitoring.auto_retire_inactive_hours;
        let now = Local::now().naive_local();

        let mut candidates = self.store.agents_with_status(AgentStatus::Active).await?;
        candidates.extend(self.store.agents_with_status(AgentStatus::Probation).await?);

        for agent in candidates {
            let Some(last) = agent.last_heartbeat.as_deref().and_then(parse_ts) else {
                continue;
            };
            if now - last <= chrono::Duration::hours(horizon) {
                continue;
            }
            if self.orchestrator.is_agent_protected(&agent.id).await? {
                continue;
            }
            warn!(
                "Auto-retiring agent {} after {horizon}h of inactivity",
                agent.id
            );
            self.orchestrator.handle_retirement(&agent.id).await?;
            self.store
                .log_activity(
                    &agent.id,
                    "alert",
                    &format!("Auto-retired after {horizon} hours of inactivity"),
                    false,
                )
                .await?;
        }
        Ok(())
    }

    /// Dashboard summary of classifications across active agents.
    pub async fn activity_summary(&self) -> Result<serde_json::Value> {
        let mut healthy = 0u64;
        let mut idle = 0u64;
        let mut warning = 0u64;
        let mut critical = 0u64;
        for agent in self.store.agents_with_status(AgentStatus::Active).await? {
            match self.activity_status(&agent).await {
                ActivityStatus::Healthy => healthy += 1,
                ActivityStatus::Idle | ActivityStatus::Unknown => idle += 1,
                ActivityStatus::Warning => warning += 1,
                ActivityStatus::Critical => critical += 1,
                // Stagnant agents are prompted, not surfaced in the counts.
                ActivityStatus::Stagnant => {}
            }
        }
        Ok(json!({
            "healthy_count": healthy,
            "idle_count": idle,
            "warning_count": warning,
            "critical_count": critical,
        }))
    }

    /// Agents needing attention: anything not HEALTHY/UNKNOWN, over the
    /// ACTIVE and PROBATION populations.
    pub async fn alerts(&self) -> Result<Vec<serde_json::Value>> {
        let mut agents = self.store.agents_with_status(AgentStatus::Active).await?;
        agents.extend(self.store.agents_with_status(AgentStatus::Probation).await?);

        let mut alerts = Vec::new();
        for agent in agents {
            let status = self.activity_status(&agent).await;
            if matches!(status, ActivityStatus::Healthy | ActivityStatus::Unknown) {
                continue;
            }
            alerts.push(json!({
                "agent_id": agent.id,
                "display_name": agent.display_name.clone().unwrap_or_else(|| agent.id.clone()),
                "status": status.as_str(),
                "last_heartbeat": agent.last_heartbeat,
                "is_protected": agent.is_protected,
            }));
        }
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;

    fn config() -> ActivityMonitoringConfig {
        Config::default().activity_monitoring
    }

    fn ts(raw: &str) -> NaiveDateTime {
        parse_ts(raw).unwrap()
    }

    #[test]
    fn no_heartbeat_is_unknown() {
        let now = ts("2026-08-01T12:00:00");
        assert_eq!(
            classify_elapsed(None, now, &config()),
            ActivityStatus::Unknown
        );
    }

    #[test]
    fn thresholds_escalate_with_elapsed_time() {
        let now = ts("2026-08-01T12:00:00");
        let config = config();
        // 30 minutes: healthy.
        assert_eq!(
            classify_elapsed(Some(ts("2026-08-01T11:30:00")), now, &config),
            ActivityStatus::Healthy
        );
        // 2 hours: past the 90-minute idle threshold.
        assert_eq!(
            classify_elapsed(Some(ts("2026-08-01T10:00:00")), now, &config),
            ActivityStatus::Idle
        );
        // 4 hours: past the 3-hour warning threshold.
        assert_eq!(
            classify_elapsed(Some(ts("2026-08-01T08:00:00")), now, &config),
            ActivityStatus::Warning
        );
        // 7 hours: past the 6-hour critical threshold.
        assert_eq!(
            classify_elapsed(Some(ts("2026-08-01T05:00:00")), now, &config),
            ActivityStatus::Critical
        );
    }

    #[test]
    fn prompt_templates_exist_for_every_type() {
        for prompt_type in prompt_types() {
            assert!(reactivation_prompt(prompt_type).is_some());
        }
        assert!(reactivation_prompt("nonsense").is_none());
    }

    mod escalation {
        use super::super::*;
        use crate::core::config::{Config, ConfigHandle};
        use crate::core::store::test_store;
        use crate::core::store::types::NewAgent;
        use std::sync::Arc;

        async fn monitor_with_agent(
            hours_since_heartbeat: i64,
            protected: bool,
        ) -> (Arc<ActivityMonitor>, Store, tempfile::TempDir) {
            let (store, dir) = test_store().await;
            store
                .create_agent(&NewAgent {
                    id: "aaaa1111".to_string(),
                    name: "watched".to_string(),
                    display_name: None,
                    bio: None,
                    ghost_md: "# g".to_string(),
                    shell_md: "# s".to_string(),
                    site_id: "site_default".to_string(),
                    node_id: "node_default".to_string(),
                })
                .await
                .unwrap();
            let last = (Local::now().naive_local()
                - chrono::Duration::hours(hours_since_heartbeat))
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string();
            store
                .update_agent(
                    "aaaa1111",
                    &AgentUpdate {
                        status: Some(AgentStatus::Active),
                        is_protected: Some(protected),
                        last_heartbeat: Some(last),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();

            let config = ConfigHandle::for_tests(Config::default());
            let agents_dir = dir.path().join("agents");
            let orchestrator =
                Orchestrator::new(config.clone(), store.clone(), agents_dir.clone());
            let monitor = ActivityMonitor::new(config, store.clone(), orchestrator, agents_dir);
            (monitor, store, dir)
        }

        #[tokio::test]
        async fn critical_unprotected_agent_lands_in_probation() {
            let (monitor, store, _dir) = monitor_with_agent(7, false).await;
            let agent = store.get_agent("aaaa1111").await.unwrap().unwrap();
            monitor.check_and_reactivate(&agent).await.unwrap();

            let agent = store.get_agent("aaaa1111").await.unwrap().unwrap();
            assert_eq!(agent.status, AgentStatus::Probation);
            let entries = store.recent_activity("aaaa1111", 10).await.unwrap();
            assert!(entries.iter().any(|e| e.activity_type == "probation"));
        }

        #[tokio::test]
        async fn protected_agent_survives_critical_inactivity() {
            let (monitor, store, _dir) = monitor_with_agent(7, true).await;
            let agent = store.get_agent("aaaa1111").await.unwrap().unwrap();
            monitor.check_and_reactivate(&agent).await.unwrap();

            let agent = store.get_agent("aaaa1111").await.unwrap().unwrap();
            assert_eq!(agent.status, AgentStatus::Active);
            // The classification is still projected to the DB.
            assert_eq!(agent.activity_status, ActivityStatus::Critical);
        }

        #[tokio::test]
        async fn long_dead_agents_are_auto_retired() {
            // 20h beats the 18h default horizon.
            let (monitor, store, _dir) = monitor_with_agent(20, false).await;
            monitor.check_all_agents().await.unwrap();

            let agent = store.get_agent("aaaa1111").await.unwrap().unwrap();
            assert_eq!(agent.status, AgentStatus::Retired);
            assert!(agent.retired_at.is_some());
            assert!(store.get_schedule("aaaa1111").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn earned_protection_blocks_auto_retire() {
            let (monitor, store, _dir) = monitor_with_agent(20, false).await;
            store
                .insert_metric(
                    "aaaa1111",
                    &crate::core::store::types::MetricValues {
                        total_bucks: 5000,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            monitor.check_all_agents().await.unwrap();

            let agent = store.get_agent("aaaa1111").await.unwrap().unwrap();
            // Escalated to probation, but not retired.
            assert_eq!(agent.status, AgentStatus::Probation);
            assert!(agent.retired_at.is_none());
        }
    }
}
