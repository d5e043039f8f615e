//! Typed YAML configuration with explicit reload.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

/// `system.max_concurrent_agents` accepts either the literal string "auto"
/// or a fixed integer ceiling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MaxConcurrent {
    Fixed(u32),
    Auto(String),
}

impl Default for MaxConcurrent {
    fn default() -> Self {
        MaxConcurrent::Auto("auto".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub max_concurrent_agents: MaxConcurrent,
    pub cpu_threshold_high: f32,
    pub cpu_threshold_low: f32,
    pub memory_limit_per_agent_mb: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: MaxConcurrent::default(),
            cpu_threshold_high: 85.0,
            cpu_threshold_low: 70.0,
            memory_limit_per_agent_mb: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub cli_command: String,
    pub skill_url: String,
    pub execution_timeout: u64,
    pub max_retries: u32,
    pub settings_path: Option<PathBuf>,
    pub env: std::collections::BTreeMap<String, String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            cli_command: "loop".to_string(),
            skill_url: "https://assibucks.vercel.app/skill.md".to_string(),
            execution_timeout: 300,
            max_retries: 3,
            settings_path: None,
            env: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub base_interval_minutes: i64,
    pub jitter_minutes: i64,
    pub peak_hours: Vec<(u8, u8)>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            base_interval_minutes: 60,
            jitter_minutes: 8,
            peak_hours: vec![(9, 11), (20, 22)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    pub check_interval_seconds: u64,
    pub max_pending_hours: i64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 30,
            max_pending_hours: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub probation_trigger_days: i64,
    pub probation_trigger_growth: i64,
    pub probation_duration_hours: i64,
    pub auto_retire: bool,
    pub auto_create_replacement: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            probation_trigger_days: 4,
            probation_trigger_growth: 0,
            probation_duration_hours: 48,
            auto_retire: true,
            auto_create_replacement: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucksMonitoringConfig {
    pub observation_period_days: i64,
    pub min_growth_threshold: i64,
    pub grace_period_hours: i64,
}

impl Default for BucksMonitoringConfig {
    fn default() -> Self {
        Self {
            observation_period_days: 4,
            min_growth_threshold: 10,
            grace_period_hours: 48,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactivationPromptsConfig {
    pub enabled: bool,
    pub max_prompts_per_6h: u32,
    pub cooldown_minutes: i64,
}

impl Default for ReactivationPromptsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_prompts_per_6h: 3,
            cooldown_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub high_bucks_threshold: i64,
    pub high_follower_threshold: i64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            high_bucks_threshold: 1000,
            high_follower_threshold: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityMonitoringConfig {
    pub check_interval_minutes: u64,
    pub idle_threshold_minutes: i64,
    pub warning_threshold_hours: i64,
    pub critical_threshold_hours: i64,
    pub auto_retire_inactive_hours: i64,
    pub bucks_monitoring: BucksMonitoringConfig,
    pub reactivation_prompts: ReactivationPromptsConfig,
    pub protection: ProtectionConfig,
}

impl Default for ActivityMonitoringConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: 10,
            idle_threshold_minutes: 90,
            warning_threshold_hours: 3,
            critical_threshold_hours: 6,
            auto_retire_inactive_hours: 18,
            bucks_monitoring: Default::default(),
            reactivation_prompts: Default::default(),
            protection: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    pub trend_analysis_days: i64,
    pub min_confidence_threshold: f64,
    pub max_pending_agents: u32,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            trend_analysis_days: 2,
            min_confidence_threshold: 0.6,
            max_pending_agents: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub port: u16,
    pub api_port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            api_port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub system: SystemConfig,
    #[serde(rename = "loop")]
    pub loop_cfg: LoopConfig,
    pub scheduling: SchedulingConfig,
    pub activation: ActivationConfig,
    pub lifecycle: LifecycleConfig,
    pub activity_monitoring: ActivityMonitoringConfig,
    pub factory: FactoryConfig,
    pub dashboard: DashboardConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

/// The base directory holding `config.yaml`, `data/` and `agents/`.
/// `LOOPFACTORY_HOME` overrides the platform data dir.
pub fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("LOOPFACTORY_HOME") {
        return PathBuf::from(home);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("loopfactory")
}

/// Shared config cache. Reload is explicit: nothing watches the file.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigHandle {
    pub fn load(path: PathBuf) -> Result<Self> {
        let config = Config::load(&path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
            path,
        })
    }

    #[cfg(test)]
    pub fn for_tests(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: PathBuf::from("/nonexistent/config.yaml"),
        }
    }

    pub fn get(&self) -> Config {
        self.inner.read().expect("config lock poisoned").clone()
    }

    pub fn reload(&self) -> Result<()> {
        let fresh = Config::load(&self.path)?;
        *self.inner.write().expect("config lock poisoned") = fresh;
        info!("Configuration reloaded from {}", self.path.display());
        Ok(())
    }

    /// Deep-merge `updates` into the on-disk YAML, then reload the cache.
    pub fn apply_updates(&self, updates: &serde_json::Value) -> Result<()> {
        let mut current: serde_yaml::Value = if self.path.exists() {
            serde_yaml::from_str(&std::fs::read_to_string(&self.path)?)?
        } else {
            serde_yaml::Value::Mapping(Default::default())
        };
        let updates: serde_yaml::Value = serde_yaml::to_value(updates)?;
        deep_merge(&mut current, &updates);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_yaml::to_string(&current)?)?;
        self.reload()
    }
}

fn deep_merge(base: &mut serde_yaml::Value, updates: &serde_yaml::Value) {
    match (base, updates) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(update_map)) => {
            for (key, value) in update_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_mapping() && value.is_mapping() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, updates) => *base = updates.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let config = Config::default();
        assert_eq!(config.scheduling.base_interval_minutes, 60);
        assert_eq!(config.scheduling.jitter_minutes, 8);
        assert_eq!(config.activation.check_interval_seconds, 30);
        assert_eq!(config.activity_monitoring.critical_threshold_hours, 6);
        assert_eq!(config.system.memory_limit_per_agent_mb, 256);
        assert_eq!(config.system.max_concurrent_agents, MaxConcurrent::default());
        assert_eq!(config.loop_cfg.cli_command, "loop");
    }

    #[test]
    fn partial_yaml_keeps_defaults_elsewhere() {
        let yaml = r#"
scheduling:
  base_interval_minutes: 30
system:
  max_concurrent_agents: 4
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scheduling.base_interval_minutes, 30);
        assert_eq!(config.scheduling.jitter_minutes, 8);
        assert_eq!(config.system.max_concurrent_agents, MaxConcurrent::Fixed(4));
        assert_eq!(config.activity_monitoring.idle_threshold_minutes, 90);
    }

    #[test]
    fn apply_updates_deep_merges_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "scheduling:\n  base_interval_minutes: 45\n").unwrap();

        let handle = ConfigHandle::load(path).unwrap();
        assert_eq!(handle.get().scheduling.base_interval_minutes, 45);

        handle
            .apply_updates(&serde_json::json!({
                "scheduling": {"jitter_minutes": 2},
                "activation": {"max_pending_hours": 6}
            }))
            .unwrap();

        let config = handle.get();
        assert_eq!(config.scheduling.base_interval_minutes, 45);
        assert_eq!(config.scheduling.jitter_minutes, 2);
        assert_eq!(config.activation.max_pending_hours, 6);
    }
}
