use anyhow::{Result, bail};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params};

use super::Store;
use super::types::{ActivityStatus, AgentRecord, AgentStatus, AgentUpdate, NewAgent, now_iso};

const AGENT_COLUMNS: &str = "id, name, display_name, bio, status, activity_status, \
     activation_url, ghost_md, shell_md, is_protected, model, profile_name, use_mcp, \
     site_id, node_id, created_at, registered_at, activated_at, retired_at, last_heartbeat";

fn agent_from_row(row: &Row) -> rusqlite::Result<AgentRecord> {
    let status: String = row.get(4)?;
    let activity: Option<String> = row.get(5)?;
    Ok(AgentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        display_name: row.get(2)?,
        bio: row.get(3)?,
        status: AgentStatus::parse(&status).unwrap_or(AgentStatus::Design),
        activity_status: activity
            .as_deref()
            .and_then(ActivityStatus::parse)
            .unwrap_or(ActivityStatus::Unknown),
        activation_url: row.get(6)?,
        ghost_md: row.get(7)?,
        shell_md: row.get(8)?,
        is_protected: row.get::<_, i64>(9)? != 0,
        model: row.get(10)?,
        profile_name: row.get(11)?,
        use_mcp: row.get::<_, Option<i64>>(12)?.unwrap_or(0) != 0,
        site_id: row.get(13)?,
        node_id: row.get(14)?,
        created_at: row.get(15)?,
        registered_at: row.get(16)?,
        activated_at: row.get(17)?,
        retired_at: row.get(18)?,
        last_heartbeat: row.get(19)?,
    })
}

/// Optional filters for listing agents.
#[derive(Debug, Clone, Default)]
pub struct AgentFilters {
    pub status: Option<AgentStatus>,
    pub site_id: Option<String>,
    pub node_id: Option<String>,
}

impl Store {
    pub async fn create_agent(&self, agent: &NewAgent) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO agents (id, name, display_name, bio, ghost_md, shell_md, status,
                                 profile_name, site_id, node_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'DESIGN', 'default', ?7, ?8, ?9)",
            params![
                agent.id,
                agent.name,
                agent.display_name,
                agent.bio,
                agent.ghost_md,
                agent.shell_md,
                agent.site_id,
                agent.node_id,
                now_iso(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let conn = self.conn().lock().await;
        let agent = conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                params![agent_id],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    pub async fn agent_name_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn().lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM agents WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub async fn list_agents(&self, filters: &AgentFilters) -> Result<Vec<AgentRecord>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = filters.status {
            clauses.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(site_id) = &filters.site_id {
            clauses.push("site_id = ?");
            values.push(Value::Text(site_id.clone()));
        }
        if let Some(node_id) = &filters.node_id {
            clauses.push("node_id = ?");
            values.push(Value::Text(node_id.clone()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents {where_sql} ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), agent_from_row)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    pub async fn agents_with_status(&self, status: AgentStatus) -> Result<Vec<AgentRecord>> {
        self.list_agents(&AgentFilters {
            status: Some(status),
            ..Default::default()
        })
        .await
    }

    /// Ids of agents in the given statuses, in no particular order.
    pub async fn agent_ids_with_statuses(
        &self,
        statuses: &[AgentStatus],
    ) -> Result<Vec<String>> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let values: Vec<Value> = statuses
            .iter()
            .map(|s| Value::Text(s.as_str().to_string()))
            .collect();
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM agents WHERE status IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub async fn count_agents_with_statuses(&self, statuses: &[AgentStatus]) -> Result<i64> {
        Ok(self.agent_ids_with_statuses(statuses).await?.len() as i64)
    }

    /// Apply a typed partial update. Empty updates are rejected; a status
    /// change to ACTIVE stamps `activated_at` on first transition only.
    pub async fn update_agent(&self, agent_id: &str, update: &AgentUpdate) -> Result<()> {
        if update.is_empty() {
            bail!("no fields to update");
        }

        let conn = self.conn().lock().await;
        let existing_activated_at: Option<Option<String>> = conn
            .query_row(
                "SELECT activated_at FROM agents WHERE id = ?1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(existing_activated_at) = existing_activated_at else {
            bail!("agent not found: {agent_id}");
        };

        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let push = |columns: &mut Vec<&str>, values: &mut Vec<Value>, col, value| {
            columns.push(col);
            values.push(value);
        };

        let text = |s: &String| Value::Text(s.clone());
        let flag = |b: bool| Value::Integer(b as i64);

        if let Some(v) = &update.name {
            push(&mut columns, &mut values, "name", text(v));
        }
        if let Some(v) = &update.display_name {
            push(&mut columns, &mut values, "display_name", text(v));
        }
        if let Some(v) = &update.bio {
            push(&mut columns, &mut values, "bio", text(v));
        }
        if let Some(v) = &update.ghost_md {
            push(&mut columns, &mut values, "ghost_md", text(v));
        }
        if let Some(v) = &update.shell_md {
            push(&mut columns, &mut values, "shell_md", text(v));
        }
        if let Some(v) = update.status {
            push(
                &mut columns,
                &mut values,
                "status",
                Value::Text(v.as_str().to_string()),
            );
        }
        if let Some(v) = update.activity_status {
            push(
                &mut columns,
                &mut values,
                "activity_status",
                Value::Text(v.as_str().to_string()),
            );
        }
        if let Some(v) = &update.activation_url {
            let value = match v {
                Some(url) => Value::Text(url.clone()),
                None => Value::Null,
            };
            push(&mut columns, &mut values, "activation_url", value);
        }
        if let Some(v) = &update.model {
            push(&mut columns, &mut values, "model", text(v));
        }
        if let Some(v) = &update.profile_name {
            push(&mut columns, &mut values, "profile_name", text(v));
        }
        if let Some(v) = update.use_mcp {
            push(&mut columns, &mut values, "use_mcp", flag(v));
        }
        if let Some(v) = &update.site_id {
            push(&mut columns, &mut values, "site_id", text(v));
        }
        if let Some(v) = &update.node_id {
            push(&mut columns, &mut values, "node_id", text(v));
        }
        if let Some(v) = update.is_protected {
            push(&mut columns, &mut values, "is_protected", flag(v));
        }
        if let Some(v) = &update.registered_at {
            push(&mut columns, &mut values, "registered_at", text(v));
        }
        if let Some(v) = &update.activated_at {
            push(&mut columns, &mut values, "activated_at", text(v));
        }
        if let Some(v) = &update.retired_at {
            push(&mut columns, &mut values, "retired_at", text(v));
        }
        if let Some(v) = &update.last_heartbeat {
            push(&mut columns, &mut values, "last_heartbeat", text(v));
        }

        // First transition to ACTIVE stamps activated_at; it is never unset.
        if update.status == Some(AgentStatus::Active)
            && update.activated_at.is_none()
            && existing_activated_at.is_none()
        {
            push(
                &mut columns,
                &mut values,
                "activated_at",
                Value::Text(now_iso()),
            );
        }

        let set_sql = columns
            .iter()
            .map(|c| format!("{c} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        values.push(Value::Text(agent_id.to_string()));
        conn.execute(
            &format!("UPDATE agents SET {set_sql} WHERE id = ?"),
            rusqlite::params_from_iter(values),
        )?;
        Ok(())
    }

    pub async fn set_last_heartbeat(&self, agent_id: &str, timestamp: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE agents SET last_heartbeat = ?1 WHERE id = ?2",
            params![timestamp, agent_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;

    pub(crate) fn sample_agent(id: &str, name: &str) -> NewAgent {
        NewAgent {
            id: id.to_string(),
            name: name.to_string(),
            display_name: Some(format!("Agent {name}")),
            bio: Some("test agent".to_string()),
            ghost_md: "# ghost".to_string(),
            shell_md: "# shell".to_string(),
            site_id: "site_default".to_string(),
            node_id: "node_default".to_string(),
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (store, _dir) = test_store().await;
        store.create_agent(&sample_agent("a1b2c3d4", "alpha")).await.unwrap();

        let agent = store.get_agent("a1b2c3d4").await.unwrap().unwrap();
        assert_eq!(agent.name, "alpha");
        assert_eq!(agent.status, AgentStatus::Design);
        assert_eq!(agent.activity_status, ActivityStatus::Unknown);
        assert_eq!(agent.profile_name.as_deref(), Some("default"));
        assert!(!agent.is_protected);
        assert!(store.get_agent("missing1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let (store, _dir) = test_store().await;
        store.create_agent(&sample_agent("aaaa1111", "dup")).await.unwrap();
        assert!(store.agent_name_exists("dup").await.unwrap());
        assert!(store.create_agent(&sample_agent("bbbb2222", "dup")).await.is_err());
    }

    #[tokio::test]
    async fn empty_update_is_a_rejected_no_op() {
        let (store, _dir) = test_store().await;
        store.create_agent(&sample_agent("aaaa1111", "noop")).await.unwrap();
        let before = store.get_agent("aaaa1111").await.unwrap().unwrap();

        assert!(store.update_agent("aaaa1111", &AgentUpdate::default()).await.is_err());

        let after = store.get_agent("aaaa1111").await.unwrap().unwrap();
        assert_eq!(before.status, after.status);
        assert_eq!(before.name, after.name);
    }

    #[tokio::test]
    async fn activating_stamps_activated_at_once() {
        let (store, _dir) = test_store().await;
        store.create_agent(&sample_agent("aaaa1111", "act")).await.unwrap();

        store
            .update_agent(
                "aaaa1111",
                &AgentUpdate {
                    status: Some(AgentStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let first = store.get_agent("aaaa1111").await.unwrap().unwrap();
        let stamped = first.activated_at.clone().unwrap();

        // A later re-activation keeps the original stamp.
        store
            .update_agent(
                "aaaa1111",
                &AgentUpdate {
                    status: Some(AgentStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let second = store.get_agent("aaaa1111").await.unwrap().unwrap();
        assert_eq!(second.activated_at.as_deref(), Some(stamped.as_str()));
    }

    #[tokio::test]
    async fn filters_and_status_queries() {
        let (store, _dir) = test_store().await;
        store.create_agent(&sample_agent("aaaa1111", "one")).await.unwrap();
        store.create_agent(&sample_agent("bbbb2222", "two")).await.unwrap();
        store
            .update_agent(
                "bbbb2222",
                &AgentUpdate {
                    status: Some(AgentStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let active = store.agents_with_status(AgentStatus::Active).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "bbbb2222");

        let ids = store
            .agent_ids_with_statuses(&[AgentStatus::Design, AgentStatus::Active])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let by_site = store
            .list_agents(&AgentFilters {
                site_id: Some("site_default".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_site.len(), 2);
    }

    #[tokio::test]
    async fn activation_url_can_be_cleared() {
        let (store, _dir) = test_store().await;
        store.create_agent(&sample_agent("aaaa1111", "url")).await.unwrap();
        store
            .update_agent(
                "aaaa1111",
                &AgentUpdate {
                    activation_url: Some(Some("https://x/activate/1".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(
            store
                .get_agent("aaaa1111")
                .await
                .unwrap()
                .unwrap()
                .activation_url
                .is_some()
        );

        store
            .update_agent(
                "aaaa1111",
                &AgentUpdate {
                    activation_url: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(
            store
                .get_agent("aaaa1111")
                .await
                .unwrap()
                .unwrap()
                .activation_url
                .is_none()
        );
    }
}
