use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::Store;
use super::types::{ScheduleRecord, now_iso};
use crate::core::policy::Decision;

fn format_ts(ts: chrono::NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

impl Store {
    /// Insert or replace the schedule row for an agent. `last_run_at`
    /// survives an upsert.
    pub async fn upsert_schedule(&self, agent_id: &str, decision: &Decision) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO agent_schedule
                 (agent_id, next_run_at, policy, reason, priority, interval_minutes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(agent_id) DO UPDATE SET
                 next_run_at = excluded.next_run_at,
                 policy = excluded.policy,
                 reason = excluded.reason,
                 priority = excluded.priority,
                 interval_minutes = excluded.interval_minutes,
                 updated_at = excluded.updated_at",
            params![
                agent_id,
                format_ts(decision.next_run_at),
                decision.policy,
                decision.reason,
                decision.priority,
                decision.interval_minutes,
                now_iso(),
            ],
        )?;
        Ok(())
    }

    pub async fn delete_schedule(&self, agent_id: &str) -> Result<bool> {
        let conn = self.conn().lock().await;
        let deleted = conn.execute(
            "DELETE FROM agent_schedule WHERE agent_id = ?1",
            params![agent_id],
        )?;
        Ok(deleted > 0)
    }

    pub async fn get_schedule(&self, agent_id: &str) -> Result<Option<ScheduleRecord>> {
        let conn = self.conn().lock().await;
        let record = conn
            .query_row(
                "SELECT agent_id, next_run_at, last_run_at, policy, reason, priority, interval_minutes
                 FROM agent_schedule WHERE agent_id = ?1",
                params![agent_id],
                schedule_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare(
            "SELECT agent_id, next_run_at, last_run_at, policy, reason, priority, interval_minutes
             FROM agent_schedule ORDER BY next_run_at ASC",
        )?;
        let rows = stmt.query_map([], schedule_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub async fn mark_schedule_ran(&self, agent_id: &str, timestamp: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "UPDATE agent_schedule SET last_run_at = ?1, updated_at = ?2 WHERE agent_id = ?3",
            params![timestamp, now_iso(), agent_id],
        )?;
        Ok(())
    }
}

fn schedule_from_row(row: &rusqlite::Row) -> rusqlite::Result<ScheduleRecord> {
    Ok(ScheduleRecord {
        agent_id: row.get(0)?,
        next_run_at: row.get(1)?,
        last_run_at: row.get(2)?,
        policy: row.get(3)?,
        reason: row.get(4)?,
        priority: row.get(5)?,
        interval_minutes: row.get(6)?,
    })
}
