//! Per-agent workspace on disk: persona files, state projection, run logs.
//!
//! The DB is authoritative; `state.json` is a write-through projection kept
//! for the external CLI to read.

use anyhow::Result;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

use crate::core::store::types::now_iso;

#[derive(Debug, Clone)]
pub struct AgentWorkspace {
    root: PathBuf,
}

impl AgentWorkspace {
    pub fn new<P: AsRef<Path>>(base_dir: P, agent_id: &str) -> Self {
        Self {
            root: base_dir.as_ref().join(agent_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    pub fn ghost_path(&self) -> PathBuf {
        self.root.join("ghost.md")
    }

    pub fn shell_path(&self) -> PathBuf {
        self.root.join("shell.md")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    /// Agent-local CLI config, passed via `--config` when present.
    pub fn local_config_path(&self) -> PathBuf {
        self.root.join(".assiloop").join("config.yaml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::create_dir_all(self.log_dir()).await?;
        Ok(())
    }

    /// Create the workspace with persona files and a fresh state projection.
    pub async fn provision(&self, ghost_md: &str, shell_md: &str) -> Result<()> {
        self.ensure().await?;
        tokio::fs::write(self.ghost_path(), ghost_md).await?;
        tokio::fs::write(self.shell_path(), shell_md).await?;

        let state = json!({
            "status": "DESIGN",
            "last_heartbeat": null,
            "heartbeat_count": 0,
            "consecutive_failures": 0,
            "activity_status": "UNKNOWN",
            "last_skills_used": null,
            "metrics_snapshot": {
                "total_bucks": 0,
                "follower_count": 0,
                "post_count": 0,
                "comment_count": 0
            },
            "created_at": now_iso(),
            "updated_at": now_iso(),
        });
        tokio::fs::write(self.state_path(), serde_json::to_string_pretty(&state)?).await?;
        Ok(())
    }

    pub async fn write_file(&self, filename: &str, content: &str) -> Result<()> {
        self.ensure().await?;
        tokio::fs::write(self.root.join(filename), content).await?;
        Ok(())
    }

    /// Current state projection; an absent or corrupt file reads as empty.
    pub async fn read_state(&self) -> Map<String, Value> {
        match tokio::fs::read_to_string(self.state_path()).await {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            },
            Err(_) => Map::new(),
        }
    }

    /// Merge updates into state.json and stamp `updated_at`.
    pub async fn update_state(&self, updates: Map<String, Value>) -> Result<()> {
        let mut state = self.read_state().await;
        for (key, value) in updates {
            state.insert(key, value);
        }
        state.insert("updated_at".to_string(), Value::String(now_iso()));

        self.ensure().await?;
        tokio::fs::write(
            self.state_path(),
            serde_json::to_string_pretty(&Value::Object(state))?,
        )
        .await?;
        Ok(())
    }

    pub async fn state_counter(&self, key: &str) -> i64 {
        self.read_state()
            .await
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// Path of the newest per-run log file, if any.
    pub async fn latest_log_file(&self) -> Option<PathBuf> {
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        let mut entries = tokio::fs::read_dir(self.log_dir()).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            if newest.as_ref().is_none_or(|(when, _)| modified > *when) {
                newest = Some((modified, path));
            }
        }
        newest.map(|(_, path)| path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn provision_lays_out_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = AgentWorkspace::new(dir.path(), "aaaa1111");
        ws.provision("# ghost", "# shell").await.unwrap();

        assert!(ws.ghost_path().exists());
        assert!(ws.shell_path().exists());
        assert!(ws.log_dir().exists());

        let state = ws.read_state().await;
        assert_eq!(state.get("status").and_then(Value::as_str), Some("DESIGN"));
        assert_eq!(state.get("heartbeat_count").and_then(Value::as_i64), Some(0));
        assert!(state.contains_key("metrics_snapshot"));
    }

    #[tokio::test]
    async fn update_state_merges_and_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let ws = AgentWorkspace::new(dir.path(), "aaaa1111");
        ws.provision("# g", "# s").await.unwrap();

        let mut updates = Map::new();
        updates.insert("heartbeat_count".to_string(), json!(3));
        updates.insert("activity_status".to_string(), json!("HEALTHY"));
        ws.update_state(updates).await.unwrap();

        let state = ws.read_state().await;
        assert_eq!(state.get("heartbeat_count").and_then(Value::as_i64), Some(3));
        assert_eq!(
            state.get("activity_status").and_then(Value::as_str),
            Some("HEALTHY")
        );
        // Untouched keys survive the merge.
        assert_eq!(state.get("status").and_then(Value::as_str), Some("DESIGN"));
        assert!(state.get("updated_at").and_then(Value::as_str).is_some());
        assert_eq!(ws.state_counter("heartbeat_count").await, 3);
    }

    #[tokio::test]
    async fn missing_state_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ws = AgentWorkspace::new(dir.path(), "nobody");
        assert!(ws.read_state().await.is_empty());
        assert_eq!(ws.state_counter("consecutive_failures").await, 0);
        assert!(ws.latest_log_file().await.is_none());
    }
}
