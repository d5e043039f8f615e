//! Serialized heartbeat execution and best-effort skill-marker extraction.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use tokio::sync::Mutex;

use crate::core::config::ConfigHandle;
use crate::core::runner::AgentRunner;
use crate::core::store::Store;

#[derive(Debug, Clone)]
pub struct HeartbeatResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub log_file: Option<PathBuf>,
    pub skills_used: String,
}

/// Runs heartbeats one at a time: the mutex is process-wide, so no two CLI
/// heartbeat invocations overlap regardless of how many were admitted.
pub struct HeartbeatManager {
    config: ConfigHandle,
    store: Store,
    agents_dir: PathBuf,
    lock: Mutex<()>,
}

impl HeartbeatManager {
    pub fn new(config: ConfigHandle, store: Store, agents_dir: PathBuf) -> Self {
        Self {
            config,
            store,
            agents_dir,
            lock: Mutex::new(()),
        }
    }

    pub async fn execute_heartbeat(&self, agent_id: &str) -> HeartbeatResult {
        let runner = AgentRunner::new(
            agent_id,
            self.config.clone(),
            self.store.clone(),
            &self.agents_dir,
        );
        let outcome = {
            let _serialized = self.lock.lock().await;
            runner.run_heartbeat().await
        };

        let skills_used = extract_skills(outcome.output.as_deref());
        HeartbeatResult {
            success: outcome.success,
            output: outcome.output,
            error: outcome.error,
            log_file: outcome.log_file,
            skills_used,
        }
    }
}

fn skills_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)skills?\s*[:\-]\s*(.+)").expect("valid skills regex"))
}

/// Extract the skill marker from CLI stdout: a JSON `skills_used`/`skills`
/// key first, a `Skills: ...` line second, "unknown" otherwise.
pub fn extract_skills(output: Option<&str>) -> String {
    let Some(output) = output else {
        return "unknown".to_string();
    };
    if output.trim().is_empty() {
        return "unknown".to_string();
    }

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(output) {
        let skills = map.get("skills_used").or_else(|| map.get("skills"));
        match skills {
            Some(serde_json::Value::Array(items)) => {
                return items
                    .iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
            }
            Some(serde_json::Value::String(s)) => return s.clone(),
            _ => {}
        }
    }

    if let Some(captures) = skills_line_re().captures(output) {
        return captures[1].trim().to_string();
    }

    "unknown".to_string()
}
