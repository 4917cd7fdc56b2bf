//! Bulk messaging engine.
//!
//! Jobs fan one rendered template out to a contact list under a delay
//! discipline. Jobs are in-memory and cancellable; durability across
//! restarts is the job queue's business, which calls into the synchronous
//! execution path here.

use crate::db::models::{self, Contact};
use crate::error::{Result, WamuxError};
use crate::session::SessionManager;
use crate::template;
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Job status. `completed`, `failed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BulkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BulkStatus::Completed | BulkStatus::Failed | BulkStatus::Cancelled
        )
    }
}

/// Progress counters. `sent + failed + remaining == total` at every
/// observation point.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BulkProgress {
    pub total: u32,
    pub sent: u32,
    pub failed: u32,
    pub remaining: u32,
}

impl BulkProgress {
    fn new(total: u32) -> Self {
        Self {
            total,
            sent: 0,
            failed: 0,
            remaining: total,
        }
    }
}

/// Request shape shared by the HTTP path and the queue payload. Contacts can
/// be given inline, by id, or by group; a template either inline or by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkMessageSpec {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub contact_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub delay_between_s: u64,
    #[serde(default)]
    pub random_delay: bool,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

/// One fan-out job.
pub struct BulkJob {
    pub id: String,
    pub session_id: String,
    pub campaign_id: Option<String>,
    template: String,
    defaults: HashMap<String, String>,
    contacts: Vec<Contact>,
    delay_between: Duration,
    random_delay: bool,
    variables: HashMap<String, String>,
    status: Mutex<BulkStatus>,
    progress: Mutex<BulkProgress>,
    pub created_at: i64,
    started_at: Mutex<Option<i64>>,
    completed_at: Mutex<Option<i64>>,
    cancel: CancellationToken,
    paused: AtomicBool,
}

impl BulkJob {
    pub fn status(&self) -> BulkStatus {
        *self.status.lock().expect("status lock")
    }

    pub fn progress(&self) -> BulkProgress {
        *self.progress.lock().expect("progress lock")
    }

    fn mark_running(&self) {
        *self.status.lock().expect("status lock") = BulkStatus::Running;
        *self.started_at.lock().expect("started lock") = Some(chrono::Utc::now().timestamp());
    }

    fn finish(&self, status: BulkStatus) {
        *self.status.lock().expect("status lock") = status;
        *self.completed_at.lock().expect("completed lock") = Some(chrono::Utc::now().timestamp());
    }

    fn record_sent(&self) {
        let mut p = self.progress.lock().expect("progress lock");
        p.sent += 1;
        p.remaining = p.total - p.sent - p.failed;
    }

    fn record_failed(&self) {
        let mut p = self.progress.lock().expect("progress lock");
        p.failed += 1;
        p.remaining = p.total - p.sent - p.failed;
    }

    /// Inter-message delay, with the random factor applied when enabled.
    fn effective_delay(&self) -> Duration {
        if !self.random_delay {
            return self.delay_between;
        }
        let factor: f64 = rand::rng().random_range(0.70..=1.30);
        let scaled = self.delay_between.mul_f64(factor);
        scaled.max(Duration::from_secs(1))
    }

    fn view(&self) -> BulkJobView {
        BulkJobView {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            campaign_id: self.campaign_id.clone(),
            status: self.status(),
            progress: self.progress(),
            delay_between_s: self.delay_between.as_secs(),
            random_delay: self.random_delay,
            created_at: self.created_at,
            started_at: *self.started_at.lock().expect("started lock"),
            completed_at: *self.completed_at.lock().expect("completed lock"),
        }
    }
}

/// API-facing snapshot of a job.
#[derive(Debug, Clone, Serialize)]
pub struct BulkJobView {
    pub id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    pub status: BulkStatus,
    pub progress: BulkProgress,
    pub delay_between_s: u64,
    pub random_delay: bool,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

pub struct BulkEngine {
    manager: Arc<SessionManager>,
    pool: SqlitePool,
    jobs: RwLock<HashMap<String, Arc<BulkJob>>>,
}

impl BulkEngine {
    pub fn new(manager: Arc<SessionManager>, pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            manager,
            pool,
            jobs: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve a spec into the rendered inputs: template content, contact
    /// list, and template-declared defaults (`name=value` variable entries).
    pub async fn prepare(
        &self,
        spec: &BulkMessageSpec,
    ) -> Result<(String, Vec<Contact>, HashMap<String, String>)> {
        // Session must exist up front; connection state is checked per send.
        self.manager.session(&spec.session_id).await?;

        let (content, defaults) = match (&spec.message, &spec.template_id) {
            (Some(message), _) if !message.is_empty() => (message.clone(), HashMap::new()),
            (_, Some(template_id)) => {
                let tpl = models::template_by_id(&self.pool, template_id)
                    .await?
                    .ok_or_else(|| {
                        WamuxError::NotFound(format!("template {template_id} not found"))
                    })?;
                (tpl.content, parse_defaults(&tpl.variables))
            }
            _ => {
                return Err(WamuxError::BadRequest(
                    "either message or template_id is required".to_string(),
                ));
            }
        };

        let mut contacts = spec.contacts.clone();
        if !spec.contact_ids.is_empty() {
            contacts.extend(models::contacts_by_ids(&self.pool, &spec.contact_ids).await?);
        }
        if let Some(group_id) = &spec.group_id {
            contacts.extend(models::contacts_by_group(&self.pool, group_id).await?);
        }

        Ok((content, contacts, defaults))
    }

    fn build_job(
        &self,
        spec: &BulkMessageSpec,
        template: String,
        contacts: Vec<Contact>,
        defaults: HashMap<String, String>,
    ) -> Arc<BulkJob> {
        Arc::new(BulkJob {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: spec.session_id.clone(),
            campaign_id: spec.campaign_id.clone(),
            template,
            defaults,
            progress: Mutex::new(BulkProgress::new(contacts.len() as u32)),
            contacts,
            delay_between: Duration::from_secs(spec.delay_between_s),
            random_delay: spec.random_delay,
            variables: spec.variables.clone(),
            status: Mutex::new(BulkStatus::Pending),
            created_at: chrono::Utc::now().timestamp(),
            started_at: Mutex::new(None),
            completed_at: Mutex::new(None),
            cancel: CancellationToken::new(),
            paused: AtomicBool::new(false),
        })
    }

    /// Start a job in the background and return immediately.
    pub async fn start(&self, spec: &BulkMessageSpec) -> Result<BulkJobView> {
        let (template, contacts, defaults) = self.prepare(spec).await?;
        let job = self.build_job(spec, template, contacts, defaults);
        self.jobs.write().await.insert(job.id.clone(), job.clone());

        let manager = self.manager.clone();
        let task_job = job.clone();
        tokio::spawn(async move {
            Self::run_job(manager, task_job).await;
        });
        Ok(job.view())
    }

    /// Run a job on the caller's task. Queue workers use this path so the
    /// worker pool bounds concurrency.
    pub async fn execute(&self, spec: &BulkMessageSpec) -> Result<BulkJobView> {
        let (template, contacts, defaults) = self.prepare(spec).await?;
        let job = self.build_job(spec, template, contacts, defaults);
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Self::run_job(self.manager.clone(), job.clone()).await;
        Ok(job.view())
    }

    async fn run_job(manager: Arc<SessionManager>, job: Arc<BulkJob>) {
        job.mark_running();
        let outcome = AssertUnwindSafe(Self::run_loop(&manager, &job))
            .catch_unwind()
            .await;
        match outcome {
            Ok(status) => {
                job.finish(status);
                let p = job.progress();
                tracing::info!(
                    "bulk job {} finished: {:?} (sent={}, failed={}, remaining={})",
                    job.id,
                    status,
                    p.sent,
                    p.failed,
                    p.remaining
                );
            }
            Err(_) => {
                tracing::error!("bulk job {} panicked, marking failed", job.id);
                job.finish(BulkStatus::Failed);
            }
        }
    }

    async fn run_loop(manager: &Arc<SessionManager>, job: &Arc<BulkJob>) -> BulkStatus {
        let total = job.contacts.len();
        for (idx, contact) in job.contacts.iter().enumerate() {
            if job.cancel.is_cancelled() {
                return BulkStatus::Cancelled;
            }
            while job.paused.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = job.cancel.cancelled() => return BulkStatus::Cancelled,
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
            }

            let message = template::render(&job.template, Some(contact), &job.variables, &job.defaults);
            match manager
                .send_text_raw(&job.session_id, &contact.phone, &message, None)
                .await
            {
                Ok(_) => job.record_sent(),
                Err(e) => {
                    tracing::warn!(
                        "bulk job {}: send to {} failed: {e}",
                        job.id,
                        contact.phone
                    );
                    job.record_failed();
                }
            }

            let delay = job.effective_delay();
            if idx + 1 < total && delay > Duration::ZERO {
                tokio::select! {
                    _ = job.cancel.cancelled() => return BulkStatus::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        BulkStatus::Completed
    }

    // ---- job management -------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<BulkJobView> {
        let jobs = self.jobs.read().await;
        jobs.get(id)
            .map(|j| j.view())
            .ok_or_else(|| WamuxError::NotFound(format!("bulk job {id} not found")))
    }

    pub async fn list(&self) -> Vec<BulkJobView> {
        let jobs = self.jobs.read().await;
        let mut views: Vec<BulkJobView> = jobs.values().map(|j| j.view()).collect();
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        views
    }

    /// Request cancellation. The loop observes it within at most one
    /// inter-message delay; a job past its last send still completes.
    pub async fn cancel(&self, id: &str) -> Result<BulkJobView> {
        let jobs = self.jobs.read().await;
        let job = jobs
            .get(id)
            .ok_or_else(|| WamuxError::NotFound(format!("bulk job {id} not found")))?;
        job.cancel.cancel();
        Ok(job.view())
    }

    /// Pause a running job. The loop holds before the next send.
    pub async fn pause(&self, id: &str) -> Result<BulkJobView> {
        let jobs = self.jobs.read().await;
        let job = jobs
            .get(id)
            .ok_or_else(|| WamuxError::NotFound(format!("bulk job {id} not found")))?;
        if job.status().is_terminal() {
            return Err(WamuxError::Conflict(format!(
                "bulk job {id} already finished"
            )));
        }
        job.paused.store(true, Ordering::SeqCst);
        *job.status.lock().expect("status lock") = BulkStatus::Paused;
        Ok(job.view())
    }

    pub async fn resume(&self, id: &str) -> Result<BulkJobView> {
        let jobs = self.jobs.read().await;
        let job = jobs
            .get(id)
            .ok_or_else(|| WamuxError::NotFound(format!("bulk job {id} not found")))?;
        if job.status() != BulkStatus::Paused {
            return Err(WamuxError::Conflict(format!("bulk job {id} is not paused")));
        }
        job.paused.store(false, Ordering::SeqCst);
        *job.status.lock().expect("status lock") = BulkStatus::Running;
        Ok(job.view())
    }

    /// Delete a finished job. Running jobs must be cancelled first.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get(id)
            .ok_or_else(|| WamuxError::NotFound(format!("bulk job {id} not found")))?;
        if !job.status().is_terminal() {
            return Err(WamuxError::Conflict(format!(
                "bulk job {id} is still running"
            )));
        }
        jobs.remove(id);
        Ok(())
    }

    /// Drop terminal jobs older than `ttl`. Returns how many were removed.
    pub async fn cleanup_older_than(&self, ttl: Duration) -> usize {
        let cutoff = chrono::Utc::now().timestamp() - ttl.as_secs() as i64;
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            let completed = *job.completed_at.lock().expect("completed lock");
            !(job.status().is_terminal() && completed.is_some_and(|t| t < cutoff))
        });
        before - jobs.len()
    }

    /// Rough duration estimate for the UI: sends are treated as instant, so
    /// only inter-message delays count.
    pub fn estimate_duration(count: u32, delay_s: u64, random_delay: bool) -> Duration {
        let gaps = u64::from(count.saturating_sub(1));
        let per_gap = if random_delay { delay_s.max(1) } else { delay_s };
        Duration::from_secs(gaps * per_gap)
    }
}

/// Template variable entries of the form `name=value` become defaults;
/// bare names contribute nothing.
fn parse_defaults(variables: &[String]) -> HashMap<String, String> {
    variables
        .iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
