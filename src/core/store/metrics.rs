use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::Store;
use super::types::{MetricRecord, MetricValues, now_iso};

/// One row of the bucks leaderboard, latest metric joined per agent.
#[derive(Debug, Clone)]
pub struct LeaderboardRow {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub status: String,
    pub total_bucks: i64,
    pub follower_count: i64,
    pub post_count: i64,
    pub comment_count: i64,
}

impl Store {
    pub async fn insert_metric(&self, agent_id: &str, values: &MetricValues) -> Result<()> {
        self.insert_metric_at(agent_id, values, &now_iso()).await
    }

    pub async fn insert_metric_at(
        &self,
        agent_id: &str,
        values: &MetricValues,
        recorded_at: &str,
    ) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO metrics (agent_id, recorded_at, total_bucks, follower_count,
                                  following_count, post_count, comment_count, upvote_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                agent_id,
                recorded_at,
                values.total_bucks,
                values.follower_count,
                values.following_count,
                values.post_count,
                values.comment_count,
                values.upvote_count,
            ],
        )?;
        Ok(())
    }

    pub async fn latest_metric(&self, agent_id: &str) -> Result<Option<MetricRecord>> {
        let conn = self.conn().lock().await;
        let record = conn
            .query_row(
                "SELECT agent_id, recorded_at, total_bucks, follower_count, following_count,
                        post_count, comment_count, upvote_count
                 FROM metrics WHERE agent_id = ?1
                 ORDER BY recorded_at DESC LIMIT 1",
                params![agent_id],
                metric_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Earliest metric at or after `since` (ISO timestamp).
    pub async fn earliest_metric_since(
        &self,
        agent_id: &str,
        since: &str,
    ) -> Result<Option<MetricRecord>> {
        let conn = self.conn().lock().await;
        let record = conn
            .query_row(
                "SELECT agent_id, recorded_at, total_bucks, follower_count, following_count,
                        post_count, comment_count, upvote_count
                 FROM metrics WHERE agent_id = ?1 AND recorded_at >= ?2
                 ORDER BY recorded_at ASC LIMIT 1",
                params![agent_id, since],
                metric_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn metrics_since(&self, agent_id: &str, since: &str) -> Result<Vec<MetricRecord>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare(
            "SELECT agent_id, recorded_at, total_bucks, follower_count, following_count,
                    post_count, comment_count, upvote_count
             FROM metrics WHERE agent_id = ?1 AND recorded_at >= ?2
             ORDER BY recorded_at ASC",
        )?;
        let rows = stmt.query_map(params![agent_id, since], metric_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Sum of the latest metric per agent plus the number of agents measured.
    pub async fn latest_metric_totals(&self) -> Result<(i64, i64)> {
        let conn = self.conn().lock().await;
        let totals = conn
            .query_row(
                "SELECT COALESCE(SUM(m.total_bucks), 0), COUNT(DISTINCT m.agent_id)
                 FROM metrics m
                 INNER JOIN (
                     SELECT agent_id, MAX(recorded_at) AS max_time
                     FROM metrics GROUP BY agent_id
                 ) latest ON m.agent_id = latest.agent_id AND m.recorded_at = latest.max_time",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(totals.unwrap_or((0, 0)))
    }

    pub async fn leaderboard_rows(&self, limit: i64) -> Result<Vec<LeaderboardRow>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare(
            "SELECT a.id, a.name, a.display_name, a.status,
                    COALESCE(m.total_bucks, 0), COALESCE(m.follower_count, 0),
                    COALESCE(m.post_count, 0), COALESCE(m.comment_count, 0)
             FROM agents a
             LEFT JOIN (
                 SELECT agent_id, total_bucks, follower_count, post_count, comment_count,
                        ROW_NUMBER() OVER (PARTITION BY agent_id ORDER BY recorded_at DESC) AS rn
                 FROM metrics
             ) m ON m.agent_id = a.id AND m.rn = 1
             WHERE a.status IN ('ACTIVE', 'PENDING', 'PROBATION')
             ORDER BY COALESCE(m.total_bucks, 0) DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(LeaderboardRow {
                id: row.get(0)?,
                name: row.get(1)?,
                display_name: row.get(2)?,
                status: row.get(3)?,
                total_bucks: row.get(4)?,
                follower_count: row.get(5)?,
                post_count: row.get(6)?,
                comment_count: row.get(7)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

fn metric_from_row(row: &rusqlite::Row) -> rusqlite::Result<MetricRecord> {
    Ok(MetricRecord {
        agent_id: row.get(0)?,
        recorded_at: row.get(1)?,
        values: MetricValues {
            total_bucks: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
            follower_count: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
            following_count: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
            post_count: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
            comment_count: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
            upvote_count: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
        },
    })
}
