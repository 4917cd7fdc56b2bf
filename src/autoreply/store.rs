//! Persistence for auto-reply rules and attempt logs.

use crate::error::{Result, WamuxError};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTrigger {
    All,
    Keyword,
    NewContact,
    TimeBased,
}

impl RuleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleTrigger::All => "all",
            RuleTrigger::Keyword => "keyword",
            RuleTrigger::NewContact => "new_contact",
            RuleTrigger::TimeBased => "time_based",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(RuleTrigger::All),
            "keyword" => Some(RuleTrigger::Keyword),
            "new_contact" => Some(RuleTrigger::NewContact),
            "time_based" => Some(RuleTrigger::TimeBased),
            _ => None,
        }
    }
}

/// A stored auto-reply rule. Higher priority wins when several rules match.
#[derive(Debug, Clone, Serialize)]
pub struct AutoReplyRule {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub trigger: RuleTrigger,
    pub keywords: Vec<String>,
    pub response: String,
    pub priority: i64,
    pub delay_min_s: u32,
    pub delay_max_s: u32,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
    /// Per-rule daily cap; `None` falls back to the engine default.
    pub daily_cap: Option<u32>,
    pub is_active: bool,
    pub usage_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating or replacing a rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDraft {
    pub session_id: String,
    pub name: String,
    pub trigger: RuleTrigger,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub response: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub delay_min_s: u32,
    #[serde(default)]
    pub delay_max_s: u32,
    #[serde(default)]
    pub time_start: Option<String>,
    #[serde(default)]
    pub time_end: Option<String>,
    #[serde(default)]
    pub daily_cap: Option<u32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// One attempt log row.
#[derive(Debug, Clone, Serialize)]
pub struct AutoReplyLog {
    pub id: i64,
    pub rule_id: String,
    pub session_id: String,
    pub contact_phone: String,
    pub trigger_msg: String,
    pub response: String,
    pub success: bool,
    pub error_msg: Option<String>,
    pub created_at: i64,
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: String,
    session_id: String,
    name: String,
    trigger_kind: String,
    keywords: String,
    response: String,
    priority: i64,
    delay_min_s: i64,
    delay_max_s: i64,
    time_start: Option<String>,
    time_end: Option<String>,
    daily_cap: Option<i64>,
    is_active: bool,
    usage_count: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<RuleRow> for AutoReplyRule {
    type Error = WamuxError;

    fn try_from(row: RuleRow) -> Result<Self> {
        let trigger = RuleTrigger::parse(&row.trigger_kind)
            .ok_or_else(|| WamuxError::Internal(format!("unknown trigger {}", row.trigger_kind)))?;
        let keywords: Vec<String> = serde_json::from_str(&row.keywords).unwrap_or_default();
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            name: row.name,
            trigger,
            keywords,
            response: row.response,
            priority: row.priority,
            delay_min_s: row.delay_min_s as u32,
            delay_max_s: row.delay_max_s as u32,
            time_start: row.time_start,
            time_end: row.time_end,
            daily_cap: row.daily_cap.map(|c| c as u32),
            is_active: row.is_active,
            usage_count: row.usage_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct RuleStore {
    pool: SqlitePool,
}

impl RuleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, draft: &RuleDraft) -> Result<AutoReplyRule> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO auto_reply_rules
                (id, session_id, name, trigger_kind, keywords, response, priority,
                 delay_min_s, delay_max_s, time_start, time_end, daily_cap, is_active,
                 usage_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14, ?14)",
        )
        .bind(&id)
        .bind(&draft.session_id)
        .bind(&draft.name)
        .bind(draft.trigger.as_str())
        .bind(serde_json::to_string(&draft.keywords)?)
        .bind(&draft.response)
        .bind(draft.priority)
        .bind(i64::from(draft.delay_min_s))
        .bind(i64::from(draft.delay_max_s))
        .bind(&draft.time_start)
        .bind(&draft.time_end)
        .bind(draft.daily_cap.map(i64::from))
        .bind(draft.is_active)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get(&id).await
    }

    pub async fn update(&self, id: &str, draft: &RuleDraft) -> Result<AutoReplyRule> {
        let changed = sqlx::query(
            "UPDATE auto_reply_rules
             SET name = ?2, trigger_kind = ?3, keywords = ?4, response = ?5,
                 priority = ?6, delay_min_s = ?7, delay_max_s = ?8, time_start = ?9,
                 time_end = ?10, daily_cap = ?11, is_active = ?12, updated_at = ?13
             WHERE id = ?1",
        )
        .bind(id)
        .bind(&draft.name)
        .bind(draft.trigger.as_str())
        .bind(serde_json::to_string(&draft.keywords)?)
        .bind(&draft.response)
        .bind(draft.priority)
        .bind(i64::from(draft.delay_min_s))
        .bind(i64::from(draft.delay_max_s))
        .bind(&draft.time_start)
        .bind(&draft.time_end)
        .bind(draft.daily_cap.map(i64::from))
        .bind(draft.is_active)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if changed == 0 {
            return Err(WamuxError::NotFound(format!("rule {id} not found")));
        }
        self.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let changed = sqlx::query("DELETE FROM auto_reply_rules WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if changed == 0 {
            return Err(WamuxError::NotFound(format!("rule {id} not found")));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<AutoReplyRule> {
        let row: Option<RuleRow> = sqlx::query_as("SELECT * FROM auto_reply_rules WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| WamuxError::NotFound(format!("rule {id} not found")))?
            .try_into()
    }

    /// Active rules for a session, highest priority first.
    pub async fn active_for_session(&self, session_id: &str) -> Result<Vec<AutoReplyRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT * FROM auto_reply_rules
             WHERE session_id = ?1 AND is_active = 1
             ORDER BY priority DESC, created_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AutoReplyRule::try_from).collect()
    }

    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<AutoReplyRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT * FROM auto_reply_rules
             WHERE session_id = ?1
             ORDER BY priority DESC, created_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AutoReplyRule::try_from).collect()
    }

    pub async fn increment_usage(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE auto_reply_rules SET usage_count = usage_count + 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn log(
        &self,
        rule_id: &str,
        session_id: &str,
        contact_phone: &str,
        trigger_msg: &str,
        response: &str,
        success: bool,
        error_msg: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO auto_reply_logs
                (rule_id, session_id, contact_phone, trigger_msg, response, success,
                 error_msg, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(rule_id)
        .bind(session_id)
        .bind(contact_phone)
        .bind(trigger_msg)
        .bind(response)
        .bind(success)
        .bind(error_msg)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn logs_for_session(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<AutoReplyLog>> {
        let rows: Vec<(i64, String, String, String, String, String, bool, Option<String>, i64)> =
            sqlx::query_as(
                "SELECT id, rule_id, session_id, contact_phone, trigger_msg, response,
                        success, error_msg, created_at
                 FROM auto_reply_logs
                 WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2",
            )
            .bind(session_id)
            .bind(limit.clamp(1, 1000))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, rule_id, session_id, contact_phone, trigger_msg, response, success, error_msg, created_at)| {
                    AutoReplyLog {
                        id,
                        rule_id,
                        session_id,
                        contact_phone,
                        trigger_msg,
                        response,
                        success,
                        error_msg,
                        created_at,
                    }
                },
            )
            .collect())
    }

    /// Purge log rows older than the cutoff. Returns how many were removed.
    pub async fn purge_logs_before(&self, cutoff: i64) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM auto_reply_logs WHERE created_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}
