//! Database layer: pool management, schema migrations, and the row types
//! shared across subsystems.

pub mod models;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

/// Open (or create) the database at `path` and run migrations.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database dir {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database {}", path.display()))?;

    migrate(&pool).await?;
    tracing::info!("database ready at {}", path.display());
    Ok(pool)
}

/// Open an in-memory database. One connection only, since every SQLite
/// `:memory:` connection is its own database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("failed to open in-memory database")?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Idempotent schema creation. Columns follow the persisted-state layout of
/// the service: session metadata, auto-reply rules and logs, the durable job
/// queue, and the contact/template tables the workers read.
async fn migrate(pool: &SqlitePool) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS session_metadata (
            id TEXT PRIMARY KEY,
            phone TEXT NOT NULL,
            actual_phone TEXT,
            name TEXT NOT NULL DEFAULT '',
            position TEXT NOT NULL DEFAULT '',
            webhook_url TEXT,
            auto_reply_text TEXT,
            proxy_enabled INTEGER NOT NULL DEFAULT 0,
            proxy_type TEXT NOT NULL DEFAULT '',
            proxy_host TEXT NOT NULL DEFAULT '',
            proxy_port INTEGER NOT NULL DEFAULT 0,
            proxy_username TEXT NOT NULL DEFAULT '',
            proxy_password TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            user_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS auto_reply_rules (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            trigger_kind TEXT NOT NULL,
            keywords TEXT NOT NULL DEFAULT '[]',
            response TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            delay_min_s INTEGER NOT NULL DEFAULT 0,
            delay_max_s INTEGER NOT NULL DEFAULT 0,
            time_start TEXT,
            time_end TEXT,
            daily_cap INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1,
            usage_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_auto_reply_rules_session
            ON auto_reply_rules(session_id, is_active)",
        "CREATE TABLE IF NOT EXISTS auto_reply_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            contact_phone TEXT NOT NULL,
            trigger_msg TEXT NOT NULL,
            response TEXT NOT NULL,
            success INTEGER NOT NULL,
            error_msg TEXT,
            created_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS job_queue (
            job_id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            scheduled_at INTEGER,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            result TEXT,
            error TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_job_queue_eligible
            ON job_queue(status, scheduled_at, priority, created_at)",
        "CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            company TEXT NOT NULL DEFAULT '',
            position TEXT NOT NULL DEFAULT '',
            group_id TEXT,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        "CREATE TABLE IF NOT EXISTS message_templates (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            content TEXT NOT NULL,
            template_type TEXT NOT NULL DEFAULT 'text',
            category TEXT NOT NULL DEFAULT '',
            variables TEXT NOT NULL DEFAULT '[]'
        )",
    ];

    for sql in statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .context("schema migration failed")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = connect_in_memory().await.expect("open");
        migrate(&pool).await.expect("second run");
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(&pool)
                .await
                .expect("query");
        assert!(count.0 >= 6);
    }

    #[tokio::test]
    async fn test_connect_creates_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("test.db");
        let _pool = connect(&path).await.expect("connect");
        assert!(path.exists());
    }
}
