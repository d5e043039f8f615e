use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::Store;
use super::types::{NodeRecord, ProfileRecord};

impl Store {
    pub async fn get_profile(&self, name: &str) -> Result<Option<ProfileRecord>> {
        let conn = self.conn().lock().await;
        let record = conn
            .query_row(
                "SELECT name, env_ref, mcp_ref, use_mcp_default, system_prompt_mode, model
                 FROM agent_profiles WHERE name = ?1",
                params![name],
                |row| {
                    Ok(ProfileRecord {
                        name: row.get(0)?,
                        env_ref: row.get(1)?,
                        mcp_ref: row.get(2)?,
                        use_mcp_default: row.get::<_, Option<i64>>(3)?.unwrap_or(0) != 0,
                        system_prompt_mode: row
                            .get::<_, Option<String>>(4)?
                            .unwrap_or_else(|| "default".to_string()),
                        model: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub async fn upsert_profile(&self, profile: &ProfileRecord) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO agent_profiles
                 (name, env_ref, mcp_ref, use_mcp_default, system_prompt_mode, model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                profile.name,
                profile.env_ref,
                profile.mcp_ref,
                profile.use_mcp_default as i64,
                profile.system_prompt_mode,
                profile.model,
            ],
        )?;
        Ok(())
    }

    /// Raw JSON blob for a named env bundle.
    pub async fn get_profile_env(&self, env_ref: &str) -> Result<Option<String>> {
        let conn = self.conn().lock().await;
        let data = conn
            .query_row(
                "SELECT data FROM profile_envs WHERE name = ?1",
                params![env_ref],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    pub async fn upsert_profile_env(&self, name: &str, data: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO profile_envs (name, data) VALUES (?1, ?2)",
            params![name, data],
        )?;
        Ok(())
    }

    /// Raw JSON blob for a named MCP server list.
    pub async fn get_mcp_servers(&self, mcp_ref: &str) -> Result<Option<String>> {
        let conn = self.conn().lock().await;
        let servers = conn
            .query_row(
                "SELECT servers FROM profile_mcp_configs WHERE name = ?1",
                params![mcp_ref],
                |row| row.get(0),
            )
            .optional()?;
        Ok(servers)
    }

    pub async fn upsert_mcp_config(&self, name: &str, servers: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO profile_mcp_configs (name, servers) VALUES (?1, ?2)",
            params![name, servers],
        )?;
        Ok(())
    }

    pub async fn site_exists(&self, site_id: &str) -> Result<bool> {
        let conn = self.conn().lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM loop_sites WHERE id = ?1",
                params![site_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        let conn = self.conn().lock().await;
        let record = conn
            .query_row(
                "SELECT id, site_id, name FROM loop_nodes WHERE id = ?1",
                params![node_id],
                |row| {
                    Ok(NodeRecord {
                        id: row.get(0)?,
                        site_id: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub async fn list_sites(&self) -> Result<Vec<(String, Option<String>)>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare("SELECT id, name FROM loop_sites ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut sites = Vec::new();
        for row in rows {
            sites.push(row?);
        }
        Ok(sites)
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare("SELECT id, site_id, name FROM loop_nodes ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(NodeRecord {
                id: row.get(0)?,
                site_id: row.get(1)?,
                name: row.get(2)?,
            })
        })?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }
}
