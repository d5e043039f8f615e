//! Metrics collection and aggregate views.

use anyhow::Result;
use chrono::Local;
use serde_json::json;

use crate::core::store::Store;
use crate::core::store::types::{AgentStatus, MetricValues};

#[derive(Clone)]
pub struct AnalyticsEngine {
    store: Store,
}

impl AnalyticsEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn record_metrics(&self, agent_id: &str, values: &MetricValues) -> Result<()> {
        self.store.insert_metric(agent_id, values).await
    }

    /// Fleet-wide totals: latest metric per agent summed, plus agent counts.
    /// `pending_agents` keeps its historical meaning of "awaiting activation"
    /// and therefore counts WAITING alongside PENDING.
    pub async fn overview(&self) -> Result<serde_json::Value> {
        let (total_bucks, measured_agents) = self.store.latest_metric_totals().await?;
        let active = self
            .store
            .count_agents_with_statuses(&[AgentStatus::Active])
            .await?;
        let pending = self
            .store
            .count_agents_with_statuses(&[AgentStatus::Waiting, AgentStatus::Pending])
            .await?;
        Ok(json!({
            "total_bucks": total_bucks,
            "agent_count": measured_agents,
            "active_agents": active,
            "pending_agents": pending,
        }))
    }

    pub async fn leaderboard(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        let rows = self.store.leaderboard_rows(limit).await?;
        let mut board = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            let growth = self.calculate_growth(&row.id, 2).await?;
            board.push(json!({
                "rank": index + 1,
                "id": row.id,
                "name": row.name,
                "display_name": row.display_name.clone().unwrap_or_else(|| row.name.clone()),
                "status": row.status,
                "total_bucks": row.total_bucks,
                "follower_count": row.follower_count,
                "post_count": row.post_count,
                "growth_percent": growth,
            }));
        }
        Ok(board)
    }

    pub async fn agent_metrics(&self, agent_id: &str, days: i64) -> Result<serde_json::Value> {
        let since = iso_days_ago(days);
        let history: Vec<serde_json::Value> = self
            .store
            .metrics_since(agent_id, &since)
            .await?
            .into_iter()
            .map(|record| serde_json::to_value(&record).unwrap_or_default())
            .collect();
        let latest = self
            .store
            .latest_metric(agent_id)
            .await?
            .map(|record| serde_json::to_value(&record).unwrap_or_default())
            .unwrap_or_else(|| json!({}));

        Ok(json!({
            "agent_id": agent_id,
            "latest": latest,
            "history": history,
            "growth_2d": self.calculate_growth(agent_id, 2).await?,
            "growth_4d": self.calculate_growth(agent_id, 4).await?,
        }))
    }

    /// Bucks growth percentage over the trailing window, rounded to one
    /// decimal. A missing or zero baseline reads as no growth.
    pub async fn calculate_growth(&self, agent_id: &str, days: i64) -> Result<f64> {
        let since = iso_days_ago(days);
        let earliest = self.store.earliest_metric_since(agent_id, &since).await?;
        let latest = self.store.latest_metric(agent_id).await?;

        let (Some(earliest), Some(latest)) = (earliest, latest) else {
            return Ok(0.0);
        };
        let old_value = earliest.values.total_bucks;
        if old_value == 0 {
            return Ok(0.0);
        }
        let new_value = latest.values.total_bucks;
        let growth = (new_value - old_value) as f64 / old_value as f64 * 100.0;
        Ok((growth * 10.0).round() / 10.0)
    }
}

fn iso_days_ago(days: i64) -> String {
    (Local::now().naive_local() - chrono::Duration::days(days))
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}
