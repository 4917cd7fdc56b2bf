//! Durable projection of session metadata.
//!
//! Runtime flags (connected/logged_in/connecting) are never persisted; the
//! record is the shadow that survives restarts and drives session restore.

use crate::error::Result;
use crate::wa::ProxyConfig;
use sqlx::SqlitePool;

/// The persistent record behind one session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    /// Display identifier; synthetic for sessions created without a phone.
    pub phone: String,
    /// Registered MSISDN, populated after successful pairing.
    pub actual_phone: Option<String>,
    pub name: String,
    pub position: String,
    pub webhook_url: Option<String>,
    /// Static per-session reply sent to plain direct messages.
    pub auto_reply_text: Option<String>,
    pub proxy: Option<ProxyConfig>,
    /// Policy flag: disabled sessions refuse connects and suppress inbound
    /// side effects.
    pub enabled: bool,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    phone: String,
    actual_phone: Option<String>,
    name: String,
    position: String,
    webhook_url: Option<String>,
    auto_reply_text: Option<String>,
    proxy_enabled: bool,
    proxy_type: String,
    proxy_host: String,
    proxy_port: i64,
    proxy_username: String,
    proxy_password: String,
    enabled: bool,
    user_id: String,
    created_at: i64,
    updated_at: i64,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        let proxy = if row.proxy_host.is_empty() && !row.proxy_enabled {
            None
        } else {
            Some(ProxyConfig {
                enabled: row.proxy_enabled,
                proxy_type: row.proxy_type,
                host: row.proxy_host,
                port: row.proxy_port as u16,
                username: row.proxy_username,
                password: row.proxy_password,
            })
        };
        Self {
            id: row.id,
            phone: row.phone,
            actual_phone: row.actual_phone,
            name: row.name,
            position: row.position,
            webhook_url: row.webhook_url,
            auto_reply_text: row.auto_reply_text,
            proxy,
            enabled: row.enabled,
            user_id: row.user_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// sqlx-backed store for session metadata.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a record.
    pub async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        let proxy = record.proxy.clone().unwrap_or_default();
        sqlx::query(
            "INSERT INTO session_metadata
                (id, phone, actual_phone, name, position, webhook_url, auto_reply_text,
                 proxy_enabled, proxy_type, proxy_host, proxy_port, proxy_username,
                 proxy_password, enabled, user_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(id) DO UPDATE SET
                phone = ?2, actual_phone = ?3, name = ?4, position = ?5,
                webhook_url = ?6, auto_reply_text = ?7, proxy_enabled = ?8,
                proxy_type = ?9, proxy_host = ?10, proxy_port = ?11,
                proxy_username = ?12, proxy_password = ?13, enabled = ?14,
                user_id = ?15, updated_at = ?17",
        )
        .bind(&record.id)
        .bind(&record.phone)
        .bind(&record.actual_phone)
        .bind(&record.name)
        .bind(&record.position)
        .bind(&record.webhook_url)
        .bind(&record.auto_reply_text)
        .bind(proxy.enabled)
        .bind(&proxy.proxy_type)
        .bind(&proxy.host)
        .bind(proxy.port as i64)
        .bind(&proxy.username)
        .bind(&proxy.password)
        .bind(record.enabled)
        .bind(&record.user_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load every persisted record, for warm-start after restart.
    pub async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM session_metadata ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(SessionRecord::from).collect())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM session_metadata WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
