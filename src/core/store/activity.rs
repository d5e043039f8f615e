use anyhow::Result;
use rusqlite::params;

use super::Store;
use super::types::{ActivityLogRecord, now_iso};

impl Store {
    /// Append-only audit trail entry.
    pub async fn log_activity(
        &self,
        agent_id: &str,
        activity_type: &str,
        details: &str,
        success: bool,
    ) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO activity_log (agent_id, activity_type, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![agent_id, activity_type, details, success as i64, now_iso()],
        )?;
        Ok(())
    }

    pub async fn recent_activity(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> Result<Vec<ActivityLogRecord>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare(
            "SELECT agent_id, activity_type, details, success, created_at
             FROM activity_log WHERE agent_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id, limit], |row| {
            Ok(ActivityLogRecord {
                agent_id: row.get(0)?,
                activity_type: row.get(1)?,
                details: row.get(2)?,
                success: row.get::<_, i64>(3)? != 0,
                created_at: row.get(4)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;

    #[tokio::test]
    async fn log_and_read_back_in_reverse_order() {
        let (store, _dir) = test_store().await;
        store
            .log_activity("aaaa1111", "heartbeat", "Success: true", true)
            .await
            .unwrap();
        store
            .log_activity("aaaa1111", "alert", "Activity warning", false)
            .await
            .unwrap();
        store
            .log_activity("bbbb2222", "heartbeat", "other agent", true)
            .await
            .unwrap();

        let entries = store.recent_activity("aaaa1111", 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].activity_type, "alert");
        assert!(!entries[0].success);
        assert_eq!(entries[1].activity_type, "heartbeat");
        assert!(entries[1].success);
    }
}
