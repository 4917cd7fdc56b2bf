//! Polling worker pool for the durable queue.
//!
//! N workers each tick on the poll interval, claim a batch of eligible jobs
//! and process them sequentially. Shutdown is cooperative: workers observe
//! the cancellation token and exit after their current job.

use super::{JobPayload, JobQueue, QueuedJob, ScheduledMessageSpec};
use crate::bulk::{BulkEngine, BulkStatus};
use crate::config::QueueConfig;
use crate::error::{Result, WamuxError};
use crate::session::SessionManager;
use crate::template;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct WorkerPool {
    queue: JobQueue,
    manager: Arc<SessionManager>,
    bulk: Arc<BulkEngine>,
    config: QueueConfig,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        manager: Arc<SessionManager>,
        bulk: Arc<BulkEngine>,
        config: QueueConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            manager,
            bulk,
            config,
            shutdown,
        })
    }

    /// Spawn the worker tasks. Handles finish once shutdown is requested.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker_id| {
                let pool = self.clone();
                tokio::spawn(async move {
                    pool.worker_loop(worker_id).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize) {
        tracing::debug!("queue worker {worker_id} started");
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_s.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!("queue worker {worker_id}: poll failed: {e}");
                    }
                }
            }
        }
        tracing::debug!("queue worker {worker_id} stopped");
    }

    /// One poll iteration: claim a batch and process it sequentially.
    /// Exposed for tests, which drive the pool without the timer.
    pub async fn poll_once(&self) -> Result<usize> {
        let jobs = self.queue.claim_batch(self.config.batch_size).await?;
        let count = jobs.len();
        for job in jobs {
            self.process(job).await;
            if self.shutdown.is_cancelled() {
                break;
            }
        }
        Ok(count)
    }

    async fn process(&self, job: QueuedJob) {
        let job_id = job.job_id.clone();
        tracing::info!(
            "job {job_id}: attempt {}/{} ({})",
            job.attempts,
            job.max_attempts,
            job.job_type.as_str()
        );
        match self.dispatch(&job).await {
            Ok(summary) => {
                if let Err(e) = self.queue.complete(&job_id, &summary).await {
                    tracing::error!("job {job_id}: failed to record completion: {e}");
                }
            }
            Err(e) => {
                let permanent = matches!(
                    e,
                    WamuxError::BadRequest(_) | WamuxError::NotFound(_)
                );
                if let Err(store_err) = self.queue.fail(&job_id, &e.to_string(), permanent).await {
                    tracing::error!("job {job_id}: failed to record failure: {store_err}");
                }
            }
        }
    }

    async fn dispatch(&self, job: &QueuedJob) -> Result<String> {
        match &job.payload {
            JobPayload::BulkMessage(spec) => {
                let view = self.bulk.execute(spec).await?;
                if view.status == BulkStatus::Failed {
                    return Err(WamuxError::Internal(format!(
                        "bulk job {} failed mid-run",
                        view.id
                    )));
                }
                Ok(serde_json::json!({
                    "bulk_job_id": view.id,
                    "status": view.status,
                    "sent": view.progress.sent,
                    "failed": view.progress.failed,
                })
                .to_string())
            }
            JobPayload::ScheduledMessage(spec) => self.dispatch_scheduled(spec).await,
        }
    }

    async fn dispatch_scheduled(&self, spec: &ScheduledMessageSpec) -> Result<String> {
        let message = template::render(&spec.message, None, &spec.variables, &HashMap::new());
        let receipt = match spec.message_type.as_str() {
            "media" => {
                let url = spec.media_url.as_deref().ok_or_else(|| {
                    WamuxError::BadRequest("media message without media_url".to_string())
                })?;
                self.manager
                    .send_file_from_url_raw(&spec.session_id, &spec.phone, url, Some(message))
                    .await?
            }
            _ => {
                self.manager
                    .send_text_raw(&spec.session_id, &spec.phone, &message, None)
                    .await?
            }
        };
        Ok(serde_json::json!({
            "message_id": receipt.message_id,
            "to": receipt.to,
        })
        .to_string())
    }
}
