//! Durable state: agents, schedule, metrics, activity log, pending
//! activations, profiles, topology. One SQLite file, one logical writer.

mod activity;
pub mod agents;
pub mod metrics;
pub mod pending;
mod profiles;
mod schedule;
pub mod types;

use anyhow::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Handle to the embedded database. Clones share the same connection; the
/// mutex serializes writers, which is all the concurrency SQLite needs here.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        run_migrations(&conn)?;
        seed_defaults(&conn)?;
        info!("Store opened at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    pub(crate) fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

/// Additive, idempotent migrations: create missing tables, add missing
/// columns, never drop. Safe to run on every startup.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            display_name TEXT,
            bio TEXT,
            status TEXT DEFAULT 'DESIGN',
            activation_url TEXT,
            ghost_md TEXT,
            shell_md TEXT,
            is_protected INTEGER DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            registered_at DATETIME,
            activated_at DATETIME,
            retired_at DATETIME,
            last_heartbeat DATETIME
        )",
        [],
    )?;

    // Columns that arrived after the first schema version.
    ensure_column(conn, "agents", "activity_status", "TEXT DEFAULT 'UNKNOWN'")?;
    ensure_column(conn, "agents", "model", "TEXT")?;
    ensure_column(conn, "agents", "profile_name", "TEXT DEFAULT 'default'")?;
    ensure_column(conn, "agents", "use_mcp", "INTEGER DEFAULT 0")?;
    ensure_column(conn, "agents", "site_id", "TEXT")?;
    ensure_column(conn, "agents", "node_id", "TEXT")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id TEXT REFERENCES agents(id),
            recorded_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            total_bucks INTEGER,
            follower_count INTEGER,
            following_count INTEGER,
            post_count INTEGER,
            comment_count INTEGER,
            upvote_count INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id TEXT REFERENCES agents(id),
            activity_type TEXT,
            details TEXT,
            success INTEGER,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pending_activation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id TEXT REFERENCES agents(id),
            activation_url TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            last_checked DATETIME,
            check_count INTEGER DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS agent_schedule (
            agent_id TEXT PRIMARY KEY REFERENCES agents(id),
            next_run_at DATETIME NOT NULL,
            last_run_at DATETIME,
            policy TEXT NOT NULL DEFAULT 'heartbeat',
            reason TEXT,
            priority INTEGER DEFAULT 0,
            interval_minutes INTEGER,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS loop_sites (
            id TEXT PRIMARY KEY,
            name TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS loop_nodes (
            id TEXT PRIMARY KEY,
            site_id TEXT NOT NULL REFERENCES loop_sites(id),
            name TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profile_envs (
            name TEXT PRIMARY KEY,
            data TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profile_mcp_configs (
            name TEXT PRIMARY KEY,
            servers TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS agent_profiles (
            name TEXT PRIMARY KEY,
            env_ref TEXT,
            mcp_ref TEXT,
            use_mcp_default INTEGER DEFAULT 0,
            model TEXT
        )",
        [],
    )?;
    ensure_column(
        conn,
        "agent_profiles",
        "system_prompt_mode",
        "TEXT DEFAULT 'default'",
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_metrics_agent_recorded
         ON metrics(agent_id, recorded_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_agent_created
         ON activity_log(agent_id, created_at)",
        [],
    )?;

    Ok(())
}

fn seed_defaults(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO loop_sites (id, name) VALUES ('site_default', 'Default Site')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO loop_nodes (id, site_id, name)
         VALUES ('node_default', 'site_default', 'Default Node')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO agent_profiles (name, env_ref, mcp_ref, use_mcp_default, system_prompt_mode, model)
         VALUES ('default', NULL, NULL, 0, 'default', NULL)",
        [],
    )?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;
    if !existing.iter().any(|c| c == column) {
        conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"),
            [],
        )?;
    }
    Ok(())
}

/// Open a throwaway store in a temp directory. Test-only.
#[cfg(test)]
pub async fn test_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::open(dir.path().join("mcn.db"))
        .await
        .expect("open test store");
    (store, dir)
}
