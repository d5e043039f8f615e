//! Resolution of an agent's effective execution profile.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::warn;

use crate::core::store::Store;

/// Everything the runner needs from the profile tables, already decoded.
#[derive(Debug, Clone, Default)]
pub struct ResolvedProfile {
    pub env: BTreeMap<String, String>,
    pub mcp_servers: Vec<serde_json::Value>,
    pub system_prompt_mode: String,
    pub model: Option<String>,
}

/// Resolve env map, MCP server list, prompt mode and effective model for an
/// agent. Missing rows degrade to defaults; the profile model outranks the
/// agent's own model override.
pub async fn resolve_agent_profile(store: &Store, agent_id: &str) -> Result<ResolvedProfile> {
    let agent = store.get_agent(agent_id).await?;
    let (profile_name, use_mcp, agent_model) = match &agent {
        Some(agent) => (
            agent
                .profile_name
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            agent.use_mcp,
            agent.model.clone(),
        ),
        None => ("default".to_string(), false, None),
    };

    let mut resolved = ResolvedProfile {
        system_prompt_mode: "default".to_string(),
        model: agent_model.clone(),
        ..Default::default()
    };

    let Some(profile) = store.get_profile(&profile_name).await? else {
        warn!(
            "Profile '{}' not found for agent {}; using defaults",
            profile_name, agent_id
        );
        return Ok(resolved);
    };

    if let Some(env_ref) = &profile.env_ref {
        resolved.env = decode_env(store.get_profile_env(env_ref).await?.as_deref());
    }
    if let Some(model) = &profile.model {
        resolved.model = Some(model.clone());
    }
    if !profile.system_prompt_mode.is_empty() {
        resolved.system_prompt_mode = profile.system_prompt_mode.clone();
    }

    if use_mcp || profile.use_mcp_default {
        if let Some(mcp_ref) = &profile.mcp_ref {
            resolved.mcp_servers =
                decode_servers(store.get_mcp_servers(mcp_ref).await?.as_deref());
        }
    }

    Ok(resolved)
}

fn decode_env(raw: Option<&str>) -> BTreeMap<String, String> {
    let Some(raw) = raw else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect(),
        _ => {
            warn!("Profile env blob is not a JSON object; ignoring");
            BTreeMap::new()
        }
    }
}

fn decode_servers(raw: Option<&str>) -> Vec<serde_json::Value> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(servers)) => servers,
        _ => {
            warn!("MCP server blob is not a JSON array; ignoring");
            Vec::new()
        }
    }
}
