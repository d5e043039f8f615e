//! Execution of the external agent CLI for a single prompt.
//!
//! The runner never raises to its callers: every path collapses into a
//! structured [`RunOutcome`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Local;
use tokio::process::Command;
use tracing::{error, warn};

use crate::core::config::ConfigHandle;
use crate::core::profiles::{ResolvedProfile, resolve_agent_profile};
use crate::core::store::Store;
use crate::core::store::types::AgentRecord;
use crate::core::workspace::AgentWorkspace;

pub const MAX_RETRY_ATTEMPTS: u32 = 8;
pub const REGISTRATION_TIMEOUT_SECS: u64 = 120;
pub const STATUS_CHECK_TIMEOUT_SECS: u64 = 180;

const RETRYABLE_ERROR_KEYWORDS: [&str; 6] = [
    "concurrency",
    "rate limit",
    "rate-limit",
    "too many requests",
    "429",
    "resource_exhausted",
];

/// Why a run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    CliNotFound,
    Subprocess,
    Other,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub log_file: Option<PathBuf>,
    pub return_code: i64,
    pub attempts: u32,
    pub failure: Option<FailureKind>,
}

struct AttemptRecord {
    return_code: i64,
    retryable: bool,
    stdout: String,
    stderr: String,
}

/// Exponential backoff before retry n+1, capped at 30 s.
pub(crate) fn backoff_seconds(attempt: u32) -> u64 {
    (1u64 << (attempt - 1).min(62)).min(30)
}

/// Backoff as a wait: seconds in a running supervisor, hundredths under
/// test builds so the retry loop can be exercised end to end.
fn backoff_delay(attempt: u32) -> Duration {
    let seconds = backoff_seconds(attempt);
    if cfg!(test) {
        Duration::from_millis(seconds * 10)
    } else {
        Duration::from_secs(seconds)
    }
}

fn is_retryable_limit_error(stdout: &str, stderr: &str) -> bool {
    let combined = format!("{stdout}\n{stderr}").to_lowercase();
    RETRYABLE_ERROR_KEYWORDS
        .iter()
        .any(|keyword| combined.contains(keyword))
}

pub struct AgentRunner {
    agent_id: String,
    config: ConfigHandle,
    store: Store,
    workspace: AgentWorkspace,
}

impl AgentRunner {
    pub fn new<P: AsRef<Path>>(
        agent_id: &str,
        config: ConfigHandle,
        store: Store,
        agents_dir: P,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            config,
            store,
            workspace: AgentWorkspace::new(agents_dir, agent_id),
        }
    }

    pub fn workspace(&self) -> &AgentWorkspace {
        &self.workspace
    }

    pub async fn run_heartbeat(&self) -> RunOutcome {
        let timeout = self.config.get().loop_cfg.execution_timeout;
        self.execute(
            "Perform your heartbeat routine as defined in your shell.",
            Duration::from_secs(timeout),
        )
        .await
    }

    pub async fn run_registration(&self, agent: &AgentRecord) -> RunOutcome {
        let prompt = format!(
            "Register yourself on AssiBucks with the following info:\n\
             - name: {}\n\
             - display_name: {}\n\
             - bio: {}\n\n\
             After registration, report back the activation_url.",
            agent.name,
            agent.display_name.as_deref().unwrap_or(&agent.name),
            agent.bio.as_deref().unwrap_or(""),
        );
        self.execute(&prompt, Duration::from_secs(REGISTRATION_TIMEOUT_SECS))
            .await
    }

    pub async fn check_activation_status(&self) -> RunOutcome {
        self.execute(
            "Check your current status using get_my_profile.",
            Duration::from_secs(STATUS_CHECK_TIMEOUT_SECS),
        )
        .await
    }

    pub async fn run_with_prompt(&self, prompt: &str) -> RunOutcome {
        let timeout = self.config.get().loop_cfg.execution_timeout;
        self.execute(prompt, Duration::from_secs(timeout)).await
    }

    async fn execute(&self, prompt: &str, timeout: Duration) -> RunOutcome {
        let config = self.config.get();
        let profile = match resolve_agent_profile(&self.store, &self.agent_id).await {
            Ok(profile) => profile,
            Err(e) => {
                error!("Profile resolution failed for {}: {e:#}", self.agent_id);
                return RunOutcome {
                    success: false,
                    output: None,
                    error: Some(format!("profile resolution failed: {e}")),
                    log_file: None,
                    return_code: -1,
                    attempts: 0,
                    failure: Some(FailureKind::Other),
                };
            }
        };

        // Compact prompt mode swaps in the condensed skill document.
        let mut skill_url = config.loop_cfg.skill_url.clone();
        if profile.system_prompt_mode == "compact" && skill_url.ends_with("/skill.md") {
            skill_url = skill_url.replace("/skill.md", "/skill_compact.md");
        }

        let mut args: Vec<String> = vec![
            "--headless".to_string(),
            "--skill-url".to_string(),
            skill_url,
            "--ghost".to_string(),
            self.workspace.ghost_path().display().to_string(),
            "--shell".to_string(),
            self.workspace.shell_path().display().to_string(),
        ];
        let local_config = self.workspace.local_config_path();
        if local_config.exists() {
            args.push("--config".to_string());
            args.push(local_config.display().to_string());
        }
        args.push("--prompt".to_string());
        args.push(prompt.to_string());

        if let Err(e) = self.workspace.ensure().await {
            return RunOutcome {
                success: false,
                output: None,
                error: Some(format!("workspace setup failed: {e}")),
                log_file: None,
                return_code: -1,
                attempts: 0,
                failure: Some(FailureKind::Other),
            };
        }

        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let log_file = self.workspace.log_dir().join(format!("{timestamp}.log"));

        let env = match self.build_env(&config.loop_cfg.env, &profile).await {
            Ok(env) => env,
            Err(e) => {
                return RunOutcome {
                    success: false,
                    output: None,
                    error: Some(format!("settings preparation failed: {e}")),
                    log_file: None,
                    return_code: -1,
                    attempts: 0,
                    failure: Some(FailureKind::Other),
                };
            }
        };

        let cli = config.loop_cfg.cli_command.clone();
        let command_line = format!("{} {}", cli, args.join(" "));
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let mut cmd = Command::new(&cli);
            cmd.args(&args)
                .current_dir(self.workspace.dir())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            for (key, value) in &env {
                cmd.env(key, value);
            }

            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    error!("loop CLI not found at: {cli}");
                    return RunOutcome {
                        success: false,
                        output: None,
                        error: Some(format!(
                            "loop CLI not found at: {cli}. Check config loop.cli_command"
                        )),
                        log_file: None,
                        return_code: -1,
                        attempts: attempt,
                        failure: Some(FailureKind::CliNotFound),
                    };
                }
                Err(e) => {
                    error!("Failed to spawn loop CLI for {}: {e}", self.agent_id);
                    return RunOutcome {
                        success: false,
                        output: None,
                        error: Some(e.to_string()),
                        log_file: log_file.exists().then(|| log_file.clone()),
                        return_code: -1,
                        attempts: attempt,
                        failure: Some(FailureKind::Other),
                    };
                }
            };

            let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    error!("Error reading loop CLI output for {}: {e}", self.agent_id);
                    return RunOutcome {
                        success: false,
                        output: None,
                        error: Some(e.to_string()),
                        log_file: log_file.exists().then(|| log_file.clone()),
                        return_code: -1,
                        attempts: attempt,
                        failure: Some(FailureKind::Other),
                    };
                }
                Err(_) => {
                    error!("Loop CLI timeout for agent {}", self.agent_id);
                    let body = format!(
                        "Command: {command_line}\nTimestamp: {timestamp}\n\
                         ERROR: Timeout after {} seconds\n",
                        timeout.as_secs()
                    );
                    let _ = tokio::fs::write(&log_file, body).await;
                    return RunOutcome {
                        success: false,
                        output: None,
                        error: Some(format!(
                            "Execution timeout after {} seconds",
                            timeout.as_secs()
                        )),
                        log_file: Some(log_file),
                        return_code: -1,
                        attempts: attempt,
                        failure: Some(FailureKind::Timeout),
                    };
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let return_code = output.status.code().map(i64::from).unwrap_or(-1);
            let retryable = return_code != 0
                && attempt < MAX_RETRY_ATTEMPTS
                && is_retryable_limit_error(&stdout, &stderr);

            attempts.push(AttemptRecord {
                return_code,
                retryable,
                stdout,
                stderr,
            });

            if return_code == 0 {
                break;
            }
            if retryable {
                warn!(
                    "Retryable limit/concurrency error for agent {} (attempt {attempt}/{MAX_RETRY_ATTEMPTS}); retrying in {}s",
                    self.agent_id,
                    backoff_seconds(attempt)
                );
                tokio::time::sleep(backoff_delay(attempt)).await;
                continue;
            }
            break;
        }

        let Some(last) = attempts.last() else {
            // Unreachable: the loop records an attempt before every break.
            return RunOutcome {
                success: false,
                output: None,
                error: Some("no attempt was recorded".to_string()),
                log_file: None,
                return_code: -1,
                attempts: 0,
                failure: Some(FailureKind::Other),
            };
        };
        let model_env = env
            .get("CLAUDE_MODEL")
            .cloned()
            .unwrap_or_else(|| "(unset)".to_string());
        let mut body = format!(
            "Command: {command_line}\nTimestamp: {timestamp}\n\
             Model env (CLAUDE_MODEL): {model_env}\nReturn code: {}\n\
             Attempts: {} / {MAX_RETRY_ATTEMPTS}\n",
            last.return_code,
            attempts.len()
        );
        for (index, attempt) in attempts.iter().enumerate() {
            body.push_str(&format!(
                "\n--- ATTEMPT {} (rc={}, retryable={}) ---\n--- STDOUT ---\n{}\n--- STDERR ---\n{}\n",
                index + 1,
                attempt.return_code,
                attempt.retryable,
                attempt.stdout,
                attempt.stderr,
            ));
        }
        if let Err(e) = tokio::fs::write(&log_file, body).await {
            warn!("Failed to write run log for {}: {e}", self.agent_id);
        }

        let success = last.return_code == 0;
        RunOutcome {
            success,
            output: Some(last.stdout.clone()),
            error: (!success).then(|| last.stderr.clone()),
            log_file: Some(log_file),
            return_code: last.return_code,
            attempts: attempts.len() as u32,
            failure: (!success).then_some(FailureKind::Subprocess),
        }
    }

    /// Assemble the subprocess environment: config-level overrides first,
    /// then the model vars, then profile env (profile wins), then the
    /// settings-file pointer.
    async fn build_env(
        &self,
        config_env: &BTreeMap<String, String>,
        profile: &ResolvedProfile,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        for (key, value) in config_env {
            env.insert(key.clone(), value.clone());
        }
        env.insert("LOOP_HEADLESS".to_string(), "true".to_string());

        if let Some(model) = &profile.model {
            env.insert("CLAUDE_MODEL".to_string(), model.clone());
            // qwen's 65K context leaves ~57K for input once output is capped.
            if model.to_lowercase().contains("qwen") {
                env.insert(
                    "CLAUDE_CODE_MAX_OUTPUT_TOKENS".to_string(),
                    "8000".to_string(),
                );
            }
        } else {
            warn!("No model set for agent {}", self.agent_id);
        }

        for (key, value) in &profile.env {
            env.insert(key.clone(), value.clone());
        }

        let settings_path = self.config.get().loop_cfg.settings_path;
        let mut settings_obj: Option<serde_json::Value> = None;
        if let Some(path) = &settings_path
            && let Ok(raw) = tokio::fs::read_to_string(path).await
            && let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw)
        {
            settings_obj = Some(parsed);
        }

        if !profile.mcp_servers.is_empty() {
            let mut base = match settings_obj.take() {
                Some(serde_json::Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            base.insert(
                "mcpServers".to_string(),
                serde_json::Value::Array(profile.mcp_servers.clone()),
            );
            settings_obj = Some(serde_json::Value::Object(base));
        }

        if let Some(settings) = settings_obj {
            // Written into the workspace so the global settings stay untouched.
            let settings_file = self.workspace.settings_path();
            tokio::fs::write(&settings_file, serde_json::to_string(&settings)?).await?;
            env.insert(
                "CLAUDE_CODE_SETTINGS".to_string(),
                settings_file.display().to_string(),
            );
        } else if let Some(path) = &settings_path
            && !env.contains_key("CLAUDE_CODE_SETTINGS")
        {
            env.insert(
                "CLAUDE_CODE_SETTINGS".to_string(),
                path.display().to_string(),
            );
        }

        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Config, ConfigHandle};
    use crate::core::store::test_store;
    use crate::core::store::types::{AgentUpdate, NewAgent, ProfileRecord};
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    async fn runner_with_cli(script_body: &str) -> (AgentRunner, Store, tempfile::TempDir) {
        let (store, dir) = test_store().await;
        store
            .create_agent(&NewAgent {
                id: "aaaa1111".to_string(),
                name: "runner-test".to_string(),
                display_name: None,
                bio: None,
                ghost_md: "# g".to_string(),
                shell_md: "# s".to_string(),
                site_id: "site_default".to_string(),
                node_id: "node_default".to_string(),
            })
            .await
            .unwrap();

        let cli = write_script(dir.path(), "fake-loop", script_body);
        let mut config = Config::default();
        config.loop_cfg.cli_command = cli.display().to_string();
        config.loop_cfg.execution_timeout = 10;
        let handle = ConfigHandle::for_tests(config);

        let agents_dir = dir.path().join("agents");
        let runner = AgentRunner::new("aaaa1111", handle, store.clone(), &agents_dir);
        (runner, store, dir)
    }

    #[test]
    fn backoff_grows_exponentially_then_caps() {
        let schedule: Vec<u64> = (1..MAX_RETRY_ATTEMPTS).map(backoff_seconds).collect();
        assert_eq!(schedule, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(schedule.iter().sum::<u64>(), 91);
    }

    #[test]
    fn limit_errors_are_detected_case_insensitively() {
        assert!(is_retryable_limit_error("", "HTTP 429"));
        assert!(is_retryable_limit_error("Too Many Requests", ""));
        assert!(is_retryable_limit_error("RESOURCE_EXHAUSTED", ""));
        assert!(is_retryable_limit_error("rate-limit hit", ""));
        assert!(!is_retryable_limit_error("segfault", "core dumped"));
    }

    #[tokio::test]
    async fn successful_run_captures_output_and_log() {
        let (runner, _store, _dir) = runner_with_cli("echo heartbeat ok").await;
        let outcome = runner.run_heartbeat().await;
        assert!(outcome.success);
        assert_eq!(outcome.return_code, 0);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.output.unwrap().contains("heartbeat ok"));

        let log = std::fs::read_to_string(outcome.log_file.unwrap()).unwrap();
        assert!(log.contains("--- ATTEMPT 1"));
        assert!(log.contains("heartbeat ok"));
        assert!(log.contains("Attempts: 1 / 8"));
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_until_success() {
        // Fails with a limit error once, then succeeds.
        let (runner, _store, _dir) = runner_with_cli(
            r#"if [ -f "$PWD/.attempted" ]; then echo done; exit 0; fi
touch "$PWD/.attempted"
echo "429 Too Many Requests" >&2
exit 1"#,
        )
        .await;
        runner.workspace().ensure().await.unwrap();

        let outcome = runner.run_heartbeat().await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);

        let log = std::fs::read_to_string(outcome.log_file.unwrap()).unwrap();
        assert!(log.contains("--- ATTEMPT 1 (rc=1, retryable=true)"));
        assert!(log.contains("--- ATTEMPT 2 (rc=0"));
    }

    #[tokio::test]
    async fn retries_exhaust_after_eight_attempts() {
        // The CLI reports a limit error on every attempt, so the runner
        // walks the full backoff schedule and gives up.
        let (runner, _store, _dir) =
            runner_with_cli(r#"echo "rate limit exceeded" >&2; exit 1"#).await;

        let outcome = runner.run_heartbeat().await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, MAX_RETRY_ATTEMPTS);
        assert_eq!(outcome.return_code, 1);
        assert_eq!(outcome.failure, Some(FailureKind::Subprocess));
        assert!(outcome.error.unwrap().contains("rate limit exceeded"));

        let log = std::fs::read_to_string(outcome.log_file.unwrap()).unwrap();
        assert!(log.contains("Attempts: 8 / 8"));
        // Every attempt but the last was flagged retryable.
        assert!(log.contains("--- ATTEMPT 7 (rc=1, retryable=true)"));
        assert!(log.contains("--- ATTEMPT 8 (rc=1, retryable=false)"));
        assert!(!log.contains("--- ATTEMPT 9"));
    }

    #[tokio::test]
    async fn non_retryable_failure_returns_immediately() {
        let (runner, _store, _dir) = runner_with_cli("echo boom >&2; exit 3").await;
        let outcome = runner.run_heartbeat().await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.return_code, 3);
        assert_eq!(outcome.failure, Some(FailureKind::Subprocess));
        assert!(outcome.error.unwrap().contains("boom"));
        assert!(outcome.log_file.is_some());
    }

    #[tokio::test]
    async fn missing_cli_is_a_specific_failure() {
        let (store, dir) = test_store().await;
        let mut config = Config::default();
        config.loop_cfg.cli_command = "/nonexistent/loop-cli".to_string();
        let runner = AgentRunner::new(
            "aaaa1111",
            ConfigHandle::for_tests(config),
            store,
            dir.path().join("agents"),
        );
        let outcome = runner.run_heartbeat().await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::CliNotFound));
        assert!(outcome.error.unwrap().contains("loop CLI not found"));
        assert!(outcome.log_file.is_none());
    }

    #[tokio::test]
    async fn timeout_kills_the_subprocess() {
        let (store, dir) = test_store().await;
        let cli = write_script(dir.path(), "slow-loop", "sleep 30");
        let mut config = Config::default();
        config.loop_cfg.cli_command = cli.display().to_string();
        config.loop_cfg.execution_timeout = 1;
        let runner = AgentRunner::new(
            "aaaa1111",
            ConfigHandle::for_tests(config),
            store,
            dir.path().join("agents"),
        );

        let outcome = runner.run_heartbeat().await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Timeout));
        assert!(outcome.error.unwrap().contains("timeout after 1 seconds"));
        let log = std::fs::read_to_string(outcome.log_file.unwrap()).unwrap();
        assert!(log.contains("Timeout after 1 seconds"));
    }

    #[tokio::test]
    async fn compact_mode_rewrites_the_skill_url() {
        let (runner, store, _dir) = runner_with_cli(r#"echo "$@""#).await;
        store
            .upsert_profile(&ProfileRecord {
                name: "compact".to_string(),
                env_ref: None,
                mcp_ref: None,
                use_mcp_default: false,
                system_prompt_mode: "compact".to_string(),
                model: None,
            })
            .await
            .unwrap();
        store
            .update_agent(
                "aaaa1111",
                &AgentUpdate {
                    profile_name: Some("compact".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = runner.run_heartbeat().await;
        assert!(outcome.output.unwrap().contains("/skill_compact.md"));
    }

    #[tokio::test]
    async fn profile_env_wins_over_config_env_and_model_flows_through() {
        let (store, dir) = test_store().await;
        store
            .create_agent(&NewAgent {
                id: "aaaa1111".to_string(),
                name: "env-test".to_string(),
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
            .upsert_profile_env("env1", r#"{"MARKER":"from-profile"}"#)
            .await
            .unwrap();
        store
            .upsert_profile(&ProfileRecord {
                name: "enved".to_string(),
                env_ref: Some("env1".to_string()),
                mcp_ref: None,
                use_mcp_default: false,
                system_prompt_mode: "default".to_string(),
                model: Some("qwen-coder-7b".to_string()),
            })
            .await
            .unwrap();
        store
            .update_agent(
                "aaaa1111",
                &AgentUpdate {
                    profile_name: Some("enved".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let cli = write_script(
            dir.path(),
            "env-loop",
            r#"echo "MARKER=$MARKER MODEL=$CLAUDE_MODEL MAXTOK=$CLAUDE_CODE_MAX_OUTPUT_TOKENS HEADLESS=$LOOP_HEADLESS""#,
        );
        let mut config = Config::default();
        config.loop_cfg.cli_command = cli.display().to_string();
        config
            .loop_cfg
            .env
            .insert("MARKER".to_string(), "from-config".to_string());
        let runner = AgentRunner::new(
            "aaaa1111",
            ConfigHandle::for_tests(config),
            store,
            dir.path().join("agents"),
        );

        let output = runner.run_heartbeat().await.output.unwrap();
        assert!(output.contains("MARKER=from-profile"));
        assert!(output.contains("MODEL=qwen-coder-7b"));
        assert!(output.contains("MAXTOK=8000"));
        assert!(output.contains("HEADLESS=true"));
    }

    #[tokio::test]
    async fn mcp_servers_produce_a_merged_settings_file() {
        let (runner, store, _dir) = runner_with_cli(r#"echo "SETTINGS=$CLAUDE_CODE_SETTINGS""#).await;
        store
            .upsert_mcp_config("srv", r#"[{"name":"search","command":"mcp-search"}]"#)
            .await
            .unwrap();
        store
            .upsert_profile(&ProfileRecord {
                name: "mcp".to_string(),
                env_ref: None,
                mcp_ref: Some("srv".to_string()),
                use_mcp_default: true,
                system_prompt_mode: "default".to_string(),
                model: None,
            })
            .await
            .unwrap();
        store
            .update_agent(
                "aaaa1111",
                &AgentUpdate {
                    profile_name: Some("mcp".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = runner.run_heartbeat().await;
        let output = outcome.output.unwrap();
        assert!(output.contains("settings.json"));

        let settings_raw =
            std::fs::read_to_string(runner.workspace().settings_path()).unwrap();
        let settings: serde_json::Value = serde_json::from_str(&settings_raw).unwrap();
        assert_eq!(settings["mcpServers"][0]["name"], "search");
    }
}
