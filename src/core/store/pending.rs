use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::Store;
use super::types::{AgentStatus, PendingActivationRecord, now_iso};

/// A pending-activation row joined with the owning agent, as the activation
/// monitor consumes it.
#[derive(Debug, Clone)]
pub struct PendingAgentRow {
    pub agent_id: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub status: AgentStatus,
    pub activation_url: String,
    pub created_at: String,
    pub last_checked: Option<String>,
    pub check_count: i64,
}

impl Store {
    pub async fn insert_pending(&self, agent_id: &str, activation_url: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO pending_activation (agent_id, activation_url, created_at, check_count)
             VALUES (?1, ?2, ?3, 0)",
            params![agent_id, activation_url, now_iso()],
        )?;
        Ok(())
    }

    pub async fn delete_pending(&self, agent_id: &str) -> Result<bool> {
        let conn = self.conn().lock().await;
        let deleted = conn.execute(
            "DELETE FROM pending_activation WHERE agent_id = ?1",
            params![agent_id],
        )?;
        Ok(deleted > 0)
    }

    pub async fn get_pending(&self, agent_id: &str) -> Result<Option<PendingActivationRecord>> {
        let conn = self.conn().lock().await;
        let record = conn
            .query_row(
                "SELECT agent_id, activation_url, created_at, last_checked, check_count
                 FROM pending_activation WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok(PendingActivationRecord {
                        agent_id: row.get(0)?,
                        activation_url: row.get(1)?,
                        created_at: row.get(2)?,
                        last_checked: row.get(3)?,
                        check_count: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// All agents awaiting human activation (status WAITING or PENDING, both
    /// values are live) with their pending rows, oldest first.
    pub async fn list_pending_agents(&self) -> Result<Vec<PendingAgentRow>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare(
            "SELECT a.id, a.display_name, a.bio, a.status,
                    p.activation_url, p.created_at, p.last_checked, p.check_count
             FROM pending_activation p
             JOIN agents a ON a.id = p.agent_id
             WHERE a.status IN ('WAITING', 'PENDING')
             ORDER BY p.created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(3)?;
            Ok(PendingAgentRow {
                agent_id: row.get(0)?,
                display_name: row.get(1)?,
                bio: row.get(2)?,
                status: AgentStatus::parse(&status).unwrap_or(AgentStatus::Pending),
                activation_url: row.get(4)?,
                created_at: row.get(5)?,
                last_checked: row.get(6)?,
                check_count: row.get(7)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub async fn bump_pending_check(&self, agent_id: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE pending_activation
             SET check_count = check_count + 1, last_checked = ?1
             WHERE agent_id = ?2",
            params![now_iso(), agent_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::super::types::{AgentUpdate, NewAgent};
    use super::*;

    async fn waiting_agent(store: &Store, id: &str, name: &str) {
        store
            .create_agent(&NewAgent {
                id: id.to_string(),
                name: name.to_string(),
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
            .update_agent(
                id,
                &AgentUpdate {
                    status: Some(AgentStatus::Waiting),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pending_lifecycle() {
        let (store, _dir) = test_store().await;
        waiting_agent(&store, "aaaa1111", "pend").await;
        store
            .insert_pending("aaaa1111", "https://x/activate/aaaa1111")
            .await
            .unwrap();

        let listed = store.list_pending_agents().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, AgentStatus::Waiting);
        assert_eq!(listed[0].check_count, 0);

        store.bump_pending_check("aaaa1111").await.unwrap();
        let row = store.get_pending("aaaa1111").await.unwrap().unwrap();
        assert_eq!(row.check_count, 1);
        assert!(row.last_checked.is_some());

        assert!(store.delete_pending("aaaa1111").await.unwrap());
        assert!(!store.delete_pending("aaaa1111").await.unwrap());
        assert!(store.list_pending_agents().await.unwrap().is_empty());
    }
}
