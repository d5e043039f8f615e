//! Record types shared by the store and the rest of the core.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Agent lifecycle states. `Waiting` and `Pending` overlap historically and
/// both are preserved; see the activation monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    #[serde(rename = "DESIGN")]
    Design,
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "PROBATION")]
    Probation,
    #[serde(rename = "RETIRED")]
    Retired,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Design => "DESIGN",
            AgentStatus::Waiting => "WAITING",
            AgentStatus::Pending => "PENDING",
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Probation => "PROBATION",
            AgentStatus::Retired => "RETIRED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "DESIGN" => Some(AgentStatus::Design),
            "WAITING" => Some(AgentStatus::Waiting),
            "PENDING" => Some(AgentStatus::Pending),
            "ACTIVE" => Some(AgentStatus::Active),
            "PROBATION" => Some(AgentStatus::Probation),
            "RETIRED" => Some(AgentStatus::Retired),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Responsiveness classification computed by the activity monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityStatus {
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "HEALTHY")]
    Healthy,
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "CRITICAL")]
    Critical,
    #[serde(rename = "STAGNANT")]
    Stagnant,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Unknown => "UNKNOWN",
            ActivityStatus::Healthy => "HEALTHY",
            ActivityStatus::Idle => "IDLE",
            ActivityStatus::Warning => "WARNING",
            ActivityStatus::Critical => "CRITICAL",
            ActivityStatus::Stagnant => "STAGNANT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "UNKNOWN" => Some(ActivityStatus::Unknown),
            "HEALTHY" => Some(ActivityStatus::Healthy),
            "IDLE" => Some(ActivityStatus::Idle),
            "WARNING" => Some(ActivityStatus::Warning),
            "CRITICAL" => Some(ActivityStatus::Critical),
            "STAGNANT" => Some(ActivityStatus::Stagnant),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub status: AgentStatus,
    pub activity_status: ActivityStatus,
    pub activation_url: Option<String>,
    pub ghost_md: Option<String>,
    pub shell_md: Option<String>,
    pub is_protected: bool,
    pub model: Option<String>,
    pub profile_name: Option<String>,
    pub use_mcp: bool,
    pub site_id: Option<String>,
    pub node_id: Option<String>,
    pub created_at: Option<String>,
    pub registered_at: Option<String>,
    pub activated_at: Option<String>,
    pub retired_at: Option<String>,
    pub last_heartbeat: Option<String>,
}

/// Fields for inserting a brand-new agent (always status DESIGN).
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub ghost_md: String,
    pub shell_md: String,
    pub site_id: String,
    pub node_id: String,
}

/// Typed partial update. Columns are written in the declaration order below,
/// so update statements are deterministic. `None` means "leave unchanged";
/// for `activation_url` the inner `Option` distinguishes set from clear.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub ghost_md: Option<String>,
    pub shell_md: Option<String>,
    pub status: Option<AgentStatus>,
    pub activity_status: Option<ActivityStatus>,
    pub activation_url: Option<Option<String>>,
    pub model: Option<String>,
    pub profile_name: Option<String>,
    pub use_mcp: Option<bool>,
    pub site_id: Option<String>,
    pub node_id: Option<String>,
    pub is_protected: Option<bool>,
    pub registered_at: Option<String>,
    pub activated_at: Option<String>,
    pub retired_at: Option<String>,
    pub last_heartbeat: Option<String>,
}

impl AgentUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.display_name.is_none()
            && self.bio.is_none()
            && self.ghost_md.is_none()
            && self.shell_md.is_none()
            && self.status.is_none()
            && self.activity_status.is_none()
            && self.activation_url.is_none()
            && self.model.is_none()
            && self.profile_name.is_none()
            && self.use_mcp.is_none()
            && self.site_id.is_none()
            && self.node_id.is_none()
            && self.is_protected.is_none()
            && self.registered_at.is_none()
            && self.activated_at.is_none()
            && self.retired_at.is_none()
            && self.last_heartbeat.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleRecord {
    pub agent_id: String,
    pub next_run_at: String,
    pub last_run_at: Option<String>,
    pub policy: String,
    pub reason: String,
    pub priority: i64,
    pub interval_minutes: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricValues {
    #[serde(default)]
    pub total_bucks: i64,
    #[serde(default)]
    pub follower_count: i64,
    #[serde(default)]
    pub following_count: i64,
    #[serde(default)]
    pub post_count: i64,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(default)]
    pub upvote_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub agent_id: String,
    pub recorded_at: String,
    #[serde(flatten)]
    pub values: MetricValues,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityLogRecord {
    pub agent_id: String,
    pub activity_type: String,
    pub details: String,
    pub success: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct PendingActivationRecord {
    pub agent_id: String,
    pub activation_url: String,
    pub created_at: String,
    pub last_checked: Option<String>,
    pub check_count: i64,
}

#[derive(Debug, Clone)]
pub struct ProfileRecord {
    pub name: String,
    pub env_ref: Option<String>,
    pub mcp_ref: Option<String>,
    pub use_mcp_default: bool,
    pub system_prompt_mode: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: String,
    pub site_id: String,
    pub name: Option<String>,
}

/// Wall-clock "now" in the naive local ISO-8601 form stored throughout the DB.
pub fn now_iso() -> String {
    chrono::Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Parse either the `T`-separated ISO form this crate writes or the
/// space-separated form SQLite's CURRENT_TIMESTAMP produces.
pub fn parse_ts(raw: &str) -> Option<NaiveDateTime> {
    raw.parse::<NaiveDateTime>()
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}
