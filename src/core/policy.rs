//! Pure heartbeat scheduling heuristics: no IO, no clock beyond "now".

use chrono::{Duration, Local, NaiveDateTime};
use rand::Rng;

use crate::core::config::SchedulingConfig;
use crate::core::store::types::{ActivityStatus, AgentRecord, AgentStatus};

pub const MIN_INTERVAL_MINUTES: i64 = 5;

/// The next scheduled heartbeat for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub next_run_at: NaiveDateTime,
    pub interval_minutes: i64,
    pub policy: &'static str,
    pub reason: &'static str,
    pub priority: i64,
}

fn base_interval(config: &SchedulingConfig, agent: &AgentRecord, throttled: bool) -> i64 {
    let mut interval = config.base_interval_minutes;

    match agent.status {
        AgentStatus::Probation | AgentStatus::Pending => {
            interval = (interval / 2).max(MIN_INTERVAL_MINUTES);
        }
        AgentStatus::Design => {
            interval *= 2;
        }
        _ => {}
    }

    match agent.activity_status {
        ActivityStatus::Warning | ActivityStatus::Critical => {
            interval = (interval / 2).max(MIN_INTERVAL_MINUTES);
        }
        ActivityStatus::Idle => {
            interval = ((interval as f64 * 0.75) as i64).max(MIN_INTERVAL_MINUTES);
        }
        _ => {}
    }

    if throttled {
        interval = (interval as f64 * 1.5) as i64;
    }

    if config.jitter_minutes > 0 {
        interval += rand::thread_rng().gen_range(0..=config.jitter_minutes);
    }

    interval.max(MIN_INTERVAL_MINUTES)
}

/// Decide when the next heartbeat should run.
pub fn decide_next_run(
    config: &SchedulingConfig,
    agent: &AgentRecord,
    throttled: bool,
) -> Decision {
    let interval = base_interval(config, agent, throttled);
    Decision {
        next_run_at: Local::now().naive_local() + Duration::minutes(interval),
        interval_minutes: interval,
        policy: "heartbeat",
        reason: if throttled { "throttled" } else { "scheduled" },
        priority: if agent.status == AgentStatus::Active { -1 } else { 0 },
    }
}

/// A short deferral when resources are unavailable at launch time.
pub fn decide_backoff(minutes: i64) -> Decision {
    let interval = minutes.max(1);
    Decision {
        next_run_at: Local::now().naive_local() + Duration::minutes(interval),
        interval_minutes: interval,
        policy: "backoff",
        reason: "resource_backoff",
        priority: 5,
    }
}
