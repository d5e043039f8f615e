//! Resource-gated heartbeat scheduling.
//!
//! Each active agent holds exactly one pending one-shot timer; finishing a
//! heartbeat arms the next one, so per-agent runs can never overlap. A
//! repeated job reconciles the timer map against the store every few seconds.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Local;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::config::ConfigHandle;
use crate::core::heartbeat::HeartbeatManager;
use crate::core::policy;
use crate::core::resources::ResourceMonitor;
use crate::core::store::Store;
use crate::core::store::types::{ActivityStatus, AgentStatus, AgentUpdate, now_iso};
use crate::core::workspace::AgentWorkspace;

pub const SYNC_INTERVAL: Duration = Duration::from_secs(5);
const ADMISSION_POLL: Duration = Duration::from_secs(1);
const PAST_DUE_CLAMP: Duration = Duration::from_secs(10);
const RESOURCE_BACKOFF_MINUTES: i64 = 5;
const FAILURE_ALERT_THRESHOLD: i64 = 5;

fn sched_err(e: JobSchedulerError) -> anyhow::Error {
    anyhow::anyhow!("timer scheduler error: {e}")
}

/// Blocking-pool size: `min(1024, max(64, cpus × 16))`, overridable through
/// `LOOPFACTORY_TO_THREAD_WORKERS` (clipped to 1..=1024).
pub fn worker_pool_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    worker_pool_size_from(
        std::env::var("LOOPFACTORY_TO_THREAD_WORKERS").ok().as_deref(),
        cpus,
    )
}

fn worker_pool_size_from(override_raw: Option<&str>, cpus: usize) -> usize {
    if let Some(raw) = override_raw
        && let Ok(requested) = raw.trim().parse::<i64>()
    {
        return requested.clamp(1, 1024) as usize;
    }
    (cpus * 16).clamp(64, 1024)
}

struct Inner {
    config: ConfigHandle,
    store: Store,
    resources: Arc<ResourceMonitor>,
    heartbeats: Arc<HeartbeatManager>,
    agents_dir: PathBuf,
    timers: JobScheduler,
    active_jobs: Mutex<HashMap<String, Uuid>>,
    inflight_count: Mutex<usize>,
    admission_mutex: Mutex<()>,
    sync_job: Mutex<Option<Uuid>>,
    first_sync_done: Mutex<bool>,
}

#[derive(Clone)]
pub struct HeartbeatScheduler {
    inner: Arc<Inner>,
}

impl HeartbeatScheduler {
    pub async fn new(
        config: ConfigHandle,
        store: Store,
        resources: Arc<ResourceMonitor>,
        heartbeats: Arc<HeartbeatManager>,
        agents_dir: PathBuf,
    ) -> Result<Self> {
        let timers = JobScheduler::new().await.map_err(sched_err)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                resources,
                heartbeats,
                agents_dir,
                timers,
                active_jobs: Mutex::new(HashMap::new()),
                inflight_count: Mutex::new(0),
                admission_mutex: Mutex::new(()),
                sync_job: Mutex::new(None),
                first_sync_done: Mutex::new(false),
            }),
        })
    }

    fn timers(&self) -> JobScheduler {
        self.inner.timers.clone()
    }

    pub async fn start(&self) -> Result<()> {
        let mut timers = self.timers();
        timers.start().await.map_err(sched_err)?;

        let this = self.clone();
        let sync = Job::new_repeated_async(SYNC_INTERVAL, move |_uuid, _lock| {
            let this = this.clone();
            Box::pin(async move {
                if let Err(e) = this.sync_with_store().await {
                    error!("Schedule auto-sync failed: {e:#}");
                }
            })
        })
        .map_err(sched_err)?;
        let sync_id = timers.add(sync).await.map_err(sched_err)?;
        *self.inner.sync_job.lock().await = Some(sync_id);

        info!("Heartbeat scheduler started");
        Ok(())
    }

    /// Stop timers and the auto-sync loop. In-flight heartbeats are not
    /// awaited; their subprocesses finish on their own.
    pub async fn stop(&self) -> Result<()> {
        let mut timers = self.timers();
        if let Some(sync_id) = self.inner.sync_job.lock().await.take() {
            let _ = timers.remove(&sync_id).await;
        }
        let pending: Vec<(String, Uuid)> =
            self.inner.active_jobs.lock().await.drain().collect();
        for (_, job_id) in pending {
            let _ = timers.remove(&job_id).await;
        }
        timers.shutdown().await.map_err(sched_err)?;
        info!("Heartbeat scheduler stopped");
        Ok(())
    }

    pub async fn scheduled_agents(&self) -> Vec<String> {
        self.inner.active_jobs.lock().await.keys().cloned().collect()
    }

    pub async fn inflight_count(&self) -> usize {
        *self.inner.inflight_count.lock().await
    }

    /// Register an agent: decide the next run, persist the schedule row, arm
    /// the timer, and optionally kick off an immediate heartbeat.
    pub async fn add_agent(&self, agent_id: &str, run_immediately: bool) -> Result<()> {
        if self.inner.active_jobs.lock().await.contains_key(agent_id) {
            warn!("Agent {agent_id} already scheduled");
            return Ok(());
        }
        let Some(agent) = self.inner.store.get_agent(agent_id).await? else {
            warn!("Cannot schedule unknown agent {agent_id}");
            return Ok(());
        };

        let decision = policy::decide_next_run(&self.inner.config.get().scheduling, &agent, false);
        self.inner.store.upsert_schedule(agent_id, &decision).await?;
        self.arm_timer(agent_id, decision.next_run_at).await?;
        info!(
            "Scheduled heartbeat for agent {agent_id} in {} minutes",
            decision.interval_minutes
        );

        if run_immediately {
            let this = self.clone();
            let agent_id = agent_id.to_string();
            tokio::spawn(async move {
                this.execute_heartbeat_cycle(&agent_id).await;
            });
        }
        Ok(())
    }

    /// Cancel the timer and drop the schedule row.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        if let Some(job_id) = self.inner.active_jobs.lock().await.remove(agent_id) {
            let _ = self.timers().remove(&job_id).await;
        }
        self.inner.store.delete_schedule(agent_id).await?;
        info!("Removed heartbeat schedule for agent {agent_id}");
        Ok(())
    }

    /// Reconcile the timer map with the set of ACTIVE agents in the store.
    /// On the very first pass, newly discovered agents are scheduled without
    /// an immediate run so a restart does not stampede the host.
    pub async fn sync_with_store(&self) -> Result<()> {
        let db_active: HashSet<String> = self
            .inner
            .store
            .agent_ids_with_statuses(&[AgentStatus::Active])
            .await?
            .into_iter()
            .collect();
        let scheduled: HashSet<String> = self
            .inner
            .active_jobs
            .lock()
            .await
            .keys()
            .cloned()
            .collect();

        let first_sync = {
            let mut done = self.inner.first_sync_done.lock().await;
            let first = !*done;
            *done = true;
            first
        };

        for agent_id in db_active.difference(&scheduled) {
            info!("Auto-sync: scheduling agent {agent_id}");
            self.add_agent(agent_id, !first_sync).await?;
        }
        for agent_id in scheduled.difference(&db_active) {
            info!("Auto-sync: unscheduling agent {agent_id}");
            self.remove_agent(agent_id).await?;
        }
        Ok(())
    }

    fn arm_timer<'a>(
        &'a self,
        agent_id: &'a str,
        next_run_at: chrono::NaiveDateTime,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let delay = (next_run_at - Local::now().naive_local())
                .to_std()
                .unwrap_or(PAST_DUE_CLAMP);
            let fire_at = Instant::now() + delay.max(Duration::from_millis(10));

            let this = self.clone();
            let agent = agent_id.to_string();
            let job = Job::new_one_shot_at_instant_async(fire_at, move |job_id, _lock| {
                let this = this.clone();
                let agent = agent.clone();
                Box::pin(async move {
                    this.on_timer_fired(&agent, job_id).await;
                })
            })
            .map_err(sched_err)?;

            let mut timers = self.timers();
            let job_id = timers.add(job).await.map_err(sched_err)?;
            let previous = self
                .inner
                .active_jobs
                .lock()
                .await
                .insert(agent_id.to_string(), job_id);
            if let Some(previous) = previous {
                let _ = timers.remove(&previous).await;
            }
            Ok(())
        })
    }

    async fn on_timer_fired(&self, agent_id: &str, job_id: Uuid) {
        // The one-shot consumed itself; forget the handle unless it was
        // already replaced by a newer timer.
        {
            let mut jobs = self.inner.active_jobs.lock().await;
            if jobs.get(agent_id) == Some(&job_id) {
                jobs.remove(agent_id);
            }
        }
        self.execute_heartbeat_cycle(agent_id).await;
    }

    /// The critical path: admission, execution, bookkeeping, reschedule.
    pub async fn execute_heartbeat_cycle(&self, agent_id: &str) {
        let Ok(Some(agent)) = self.inner.store.get_agent(agent_id).await else {
            warn!("Skipping heartbeat for unknown agent {agent_id}");
            return;
        };
        info!(
            "Executing heartbeat for agent {agent_id} (profile: {})",
            agent.profile_name.as_deref().unwrap_or("default")
        );

        // Admission: strictly one launch at a time may evaluate resources.
        {
            let _admission = self.inner.admission_mutex.lock().await;
            while !self.inner.resources.can_run_agent().await {
                tokio::time::sleep(ADMISSION_POLL).await;
            }
            *self.inner.inflight_count.lock().await += 1;
        }

        // Defensive re-check after the slot was granted.
        if !self.inner.resources.can_run_agent().await {
            warn!("Resources unavailable after admission; backing off {agent_id}");
            let decision = policy::decide_backoff(RESOURCE_BACKOFF_MINUTES);
            if let Err(e) = self.inner.store.upsert_schedule(agent_id, &decision).await {
                error!("Failed to persist backoff schedule for {agent_id}: {e:#}");
            }
            if let Err(e) = self.arm_timer(agent_id, decision.next_run_at).await {
                error!("Failed to arm backoff timer for {agent_id}: {e:#}");
            }
            *self.inner.inflight_count.lock().await -= 1;
            return;
        }

        let result = self.inner.heartbeats.execute_heartbeat(agent_id).await;
        *self.inner.inflight_count.lock().await -= 1;

        let now = now_iso();
        if let Err(e) = self.inner.store.set_last_heartbeat(agent_id, &now).await {
            error!("Failed to record last_heartbeat for {agent_id}: {e:#}");
        }
        if let Err(e) = self
            .inner
            .store
            .log_activity(
                agent_id,
                "heartbeat",
                &format!("Success: {}", result.success),
                result.success,
            )
            .await
        {
            error!("Failed to log heartbeat for {agent_id}: {e:#}");
        }
        if let Err(e) = self.inner.store.mark_schedule_ran(agent_id, &now).await {
            error!("Failed to mark schedule run for {agent_id}: {e:#}");
        }

        let workspace = AgentWorkspace::new(&self.inner.agents_dir, agent_id);
        let heartbeat_count = workspace.state_counter("heartbeat_count").await + 1;
        let mut state = serde_json::Map::new();
        state.insert("last_heartbeat".to_string(), json!(now));
        state.insert("heartbeat_count".to_string(), json!(heartbeat_count));
        state.insert("last_skills_used".to_string(), json!(result.skills_used));

        if result.success {
            state.insert("consecutive_failures".to_string(), json!(0));
        } else {
            let failures = workspace.state_counter("consecutive_failures").await + 1;
            state.insert("consecutive_failures".to_string(), json!(failures));
            state.insert("activity_status".to_string(), json!("IDLE"));
            if let Err(e) = self
                .inner
                .store
                .update_agent(
                    agent_id,
                    &AgentUpdate {
                        activity_status: Some(ActivityStatus::Idle),
                        ..Default::default()
                    },
                )
                .await
            {
                error!("Failed to mark {agent_id} idle: {e:#}");
            }
            if failures >= FAILURE_ALERT_THRESHOLD {
                error!("Agent {agent_id} has {failures} consecutive failures");
            }
        }
        if let Err(e) = workspace.update_state(state).await {
            warn!("Failed to update workspace state for {agent_id}: {e:#}");
        }

        // Rearm with a fresh decision; throttling stretches the interval.
        let throttled = self.inner.resources.should_throttle().await;
        let Ok(Some(agent)) = self.inner.store.get_agent(agent_id).await else {
            return;
        };
        let decision =
            policy::decide_next_run(&self.inner.config.get().scheduling, &agent, throttled);
        if let Err(e) = self.inner.store.upsert_schedule(agent_id, &decision).await {
            error!("Failed to persist schedule for {agent_id}: {e:#}");
        }
        if let Err(e) = self.arm_timer(agent_id, decision.next_run_at).await {
            error!("Failed to arm timer for {agent_id}: {e:#}");
        }
    }
}
