//! Rule-based auto-reply engine.
//!
//! Incoming direct messages are matched against a session's active rules in
//! priority order. A matched rule fires its canned response after an optional
//! random delay, bounded by a per-contact daily cap. Every attempt is logged.

pub mod store;

pub use store::{AutoReplyLog, AutoReplyRule, RuleDraft, RuleStore, RuleTrigger};

use crate::config::AutoReplyConfig;
use crate::error::{Result, WamuxError};
use crate::session::{Session, SessionManager};
use crate::wa::{self, InboundMessage};
use chrono::{NaiveDate, NaiveTime};
use rand::Rng;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Reply bookkeeping per `(session, contact)` pair. The day is stored so a
/// lazy check on access stays correct even if the midnight sweep is late.
#[derive(Debug, Clone, Copy)]
struct ReplyStat {
    count: u32,
    day: NaiveDate,
}

/// Outcome of the non-sending rule evaluation helper.
#[derive(Debug, Clone, Serialize)]
pub struct RuleTestOutcome {
    pub would_trigger: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_s: Option<u64>,
}

pub struct AutoReplyEngine {
    store: RuleStore,
    manager: Weak<SessionManager>,
    tracker: Mutex<HashMap<(String, String), ReplyStat>>,
    default_cap: u32,
}

impl AutoReplyEngine {
    pub fn new(
        pool: SqlitePool,
        manager: &Arc<SessionManager>,
        config: AutoReplyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: RuleStore::new(pool),
            manager: Arc::downgrade(manager),
            tracker: Mutex::new(HashMap::new()),
            default_cap: config.daily_cap,
        })
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    // ---- rule management ------------------------------------------------

    pub async fn create_rule(&self, draft: &RuleDraft) -> Result<AutoReplyRule> {
        validate_draft(draft)?;
        self.store.create(draft).await
    }

    pub async fn update_rule(&self, id: &str, draft: &RuleDraft) -> Result<AutoReplyRule> {
        validate_draft(draft)?;
        self.store.update(id, draft).await
    }

    pub async fn delete_rule(&self, id: &str) -> Result<()> {
        self.store.delete(id).await
    }

    pub async fn list_rules(&self, session_id: &str) -> Result<Vec<AutoReplyRule>> {
        self.store.list_for_session(session_id).await
    }

    pub async fn logs(&self, session_id: &str, limit: i64) -> Result<Vec<AutoReplyLog>> {
        self.store.logs_for_session(session_id, limit).await
    }

    // ---- matching pipeline ----------------------------------------------

    /// Process one inbound message. Matching, the time-window gate and the
    /// cap reservation run inline on the session's event task; delayed sends
    /// are spawned so the event loop is never held across a sleep.
    pub async fn handle_inbound(self: &Arc<Self>, session: &Arc<Session>, msg: &InboundMessage) {
        if msg.is_from_me || msg.is_group || msg.text.is_empty() {
            return;
        }
        let contact = wa::jid_phone(&msg.sender_jid).to_string();

        let rules = match self.store.active_for_session(&session.id).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!("session {}: failed to load auto-reply rules: {e}", session.id);
                return;
            }
        };
        if rules.is_empty() {
            return;
        }

        let today = chrono::Local::now().date_naive();
        let is_new_contact = self.is_new_contact(&session.id, &contact, today).await;

        let Some(rule) = rules
            .iter()
            .find(|r| rule_matches(r, &msg.text, is_new_contact))
        else {
            return;
        };

        if let (Some(start), Some(end)) = (rule.time_start.as_deref(), rule.time_end.as_deref())
            && let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end))
        {
            let now = chrono::Local::now().time();
            if !window_contains(start, end, now) {
                tracing::debug!(
                    "session {}: rule {} matched outside its time window",
                    session.id,
                    rule.name
                );
                return;
            }
        }

        // Reserve the cap slot before the (possibly delayed) send so the
        // daily limit holds even with sends in flight.
        let cap = rule.daily_cap.unwrap_or(self.default_cap);
        {
            let mut tracker = self.tracker.lock().await;
            let stat = tracker
                .entry((session.id.clone(), contact.clone()))
                .or_insert(ReplyStat {
                    count: 0,
                    day: today,
                });
            if stat.day != today {
                stat.count = 0;
                stat.day = today;
            }
            if stat.count >= cap {
                tracing::debug!(
                    "session {}: daily cap ({cap}) reached for {contact}, suppressing reply",
                    session.id
                );
                return;
            }
            stat.count += 1;
        }

        let delay = draw_delay(rule.delay_min_s, rule.delay_max_s);
        let rule_id = rule.id.clone();
        let response = rule.response.clone();
        let session_id = session.id.clone();
        let trigger_msg = msg.text.clone();

        if delay.is_zero() {
            self.deliver(&rule_id, &session_id, &contact, &trigger_msg, &response)
                .await;
        } else {
            let engine = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                engine
                    .deliver(&rule_id, &session_id, &contact, &trigger_msg, &response)
                    .await;
            });
        }
    }

    async fn deliver(
        &self,
        rule_id: &str,
        session_id: &str,
        contact: &str,
        trigger_msg: &str,
        response: &str,
    ) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let outcome = manager
            .send_text_raw(session_id, contact, response, None)
            .await;
        let (success, error_msg) = match &outcome {
            Ok(_) => {
                if let Err(e) = self.store.increment_usage(rule_id).await {
                    tracing::warn!("rule {rule_id}: usage counter update failed: {e}");
                }
                tracing::info!("session {session_id}: auto-reply sent to {contact}");
                (true, None)
            }
            Err(e) => {
                tracing::warn!("session {session_id}: auto-reply to {contact} failed: {e}");
                (false, Some(e.to_string()))
            }
        };
        if let Err(e) = self
            .store
            .log(
                rule_id,
                session_id,
                contact,
                trigger_msg,
                response,
                success,
                error_msg.as_deref(),
            )
            .await
        {
            tracing::error!("session {session_id}: auto-reply log write failed: {e}");
        }
    }

    /// "New contact" means no tracked reply to this contact yet today.
    async fn is_new_contact(&self, session_id: &str, contact: &str, today: NaiveDate) -> bool {
        let tracker = self.tracker.lock().await;
        !tracker
            .get(&(session_id.to_string(), contact.to_string()))
            .is_some_and(|stat| stat.day == today && stat.count > 0)
    }

    /// Evaluate a rule against a hypothetical message without sending or
    /// reserving anything.
    pub async fn test_rule(
        &self,
        rule_id: &str,
        test_message: &str,
        test_phone: &str,
    ) -> Result<RuleTestOutcome> {
        let rule = self.store.get(rule_id).await?;
        if !rule.is_active {
            return Ok(RuleTestOutcome {
                would_trigger: false,
                reason: "rule is inactive".to_string(),
                response: None,
                delay_s: None,
            });
        }

        let today = chrono::Local::now().date_naive();
        let is_new_contact = self
            .is_new_contact(&rule.session_id, test_phone, today)
            .await;
        if !rule_matches(&rule, test_message, is_new_contact) {
            return Ok(RuleTestOutcome {
                would_trigger: false,
                reason: "message does not match the trigger".to_string(),
                response: None,
                delay_s: None,
            });
        }

        if let (Some(start), Some(end)) = (rule.time_start.as_deref(), rule.time_end.as_deref())
            && let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end))
            && !window_contains(start, end, chrono::Local::now().time())
        {
            return Ok(RuleTestOutcome {
                would_trigger: false,
                reason: "outside the rule's time window".to_string(),
                response: None,
                delay_s: None,
            });
        }

        let cap = rule.daily_cap.unwrap_or(self.default_cap);
        let count = {
            let tracker = self.tracker.lock().await;
            tracker
                .get(&(rule.session_id.clone(), test_phone.to_string()))
                .filter(|stat| stat.day == today)
                .map(|stat| stat.count)
                .unwrap_or(0)
        };
        if count >= cap {
            return Ok(RuleTestOutcome {
                would_trigger: false,
                reason: format!("daily cap ({cap}) reached for this contact"),
                response: None,
                delay_s: None,
            });
        }

        Ok(RuleTestOutcome {
            would_trigger: true,
            reason: "rule matches".to_string(),
            response: Some(rule.response.clone()),
            delay_s: Some(draw_delay(rule.delay_min_s, rule.delay_max_s).as_secs()),
        })
    }

    // ---- daily reset ----------------------------------------------------

    /// Clear all counters now.
    pub async fn reset_counters(&self) {
        self.tracker.lock().await.clear();
        tracing::info!("auto-reply daily counters reset");
    }

    /// Background task clearing the counters at each local midnight. The
    /// lazy per-entry day check keeps correctness if this task lags.
    pub fn spawn_daily_reset(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let wait = duration_until_local_midnight();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => engine.reset_counters().await,
                }
            }
        })
    }
}

fn rule_matches(rule: &AutoReplyRule, text: &str, is_new_contact: bool) -> bool {
    match rule.trigger {
        RuleTrigger::All => true,
        RuleTrigger::Keyword => {
            let haystack = text.to_lowercase();
            rule.keywords
                .iter()
                .any(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
        }
        RuleTrigger::NewContact => is_new_contact,
        // Always matches; the shared time-window gate does the real work.
        RuleTrigger::TimeBased => true,
    }
}

/// Uniform delay in `[min, max]` seconds; equal bounds mean a fixed delay.
fn draw_delay(min_s: u32, max_s: u32) -> Duration {
    let secs = if max_s > min_s {
        rand::rng().random_range(min_s..=max_s)
    } else {
        min_s
    };
    Duration::from_secs(u64::from(secs))
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Inclusive window check with midnight wrap: `22:00`–`06:00` covers the
/// late evening and the early morning.
fn window_contains(start: NaiveTime, end: NaiveTime, t: NaiveTime) -> bool {
    if start <= end {
        t >= start && t <= end
    } else {
        t >= start || t <= end
    }
}

fn duration_until_local_midnight() -> Duration {
    let now = chrono::Local::now();
    let Some(tomorrow) = now.date_naive().succ_opt() else {
        return Duration::from_secs(86_400);
    };
    let Some(midnight) = tomorrow.and_hms_opt(0, 0, 0) else {
        return Duration::from_secs(86_400);
    };
    (midnight - now.naive_local())
        .to_std()
        .unwrap_or(Duration::from_secs(60))
        .max(Duration::from_secs(1))
}

/// Field validation shared by create and update.
pub fn validate_draft(draft: &RuleDraft) -> Result<()> {
    if draft.session_id.is_empty() {
        return Err(WamuxError::BadRequest("rule needs a session_id".to_string()));
    }
    if draft.name.trim().is_empty() {
        return Err(WamuxError::BadRequest("rule needs a name".to_string()));
    }
    if draft.response.trim().is_empty() {
        return Err(WamuxError::BadRequest("rule needs a response".to_string()));
    }
    if draft.trigger == RuleTrigger::Keyword
        && !draft.keywords.iter().any(|k| !k.trim().is_empty())
    {
        return Err(WamuxError::BadRequest(
            "keyword trigger needs at least one keyword".to_string(),
        ));
    }
    if draft.delay_max_s < draft.delay_min_s {
        return Err(WamuxError::BadRequest(format!(
            "delay_max_s ({}) must be >= delay_min_s ({})",
            draft.delay_max_s, draft.delay_min_s
        )));
    }
    for (label, value) in [("time_start", &draft.time_start), ("time_end", &draft.time_end)] {
        if let Some(value) = value
            && parse_hhmm(value).is_none()
        {
            return Err(WamuxError::BadRequest(format!(
                "{label} must be HH:MM, got {value:?}"
            )));
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests;
