//! Job queue and worker pool tests.

use super::worker::WorkerPool;
use super::*;
use crate::bulk::BulkMessageSpec;
use crate::config::QueueConfig;
use crate::db::models::Contact;
use crate::testutil::{owner, stack, TestStack};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn text_payload(session_id: &str, phone: &str, message: &str) -> JobPayload {
    JobPayload::ScheduledMessage(ScheduledMessageSpec {
        session_id: session_id.to_string(),
        phone: phone.to_string(),
        message: message.to_string(),
        message_type: "text".to_string(),
        media_url: None,
        variables: HashMap::new(),
    })
}

fn pool_for(stack: &TestStack, shutdown: CancellationToken) -> Arc<WorkerPool> {
    WorkerPool::new(
        stack.queue.clone(),
        stack.manager.clone(),
        stack.bulk.clone(),
        QueueConfig {
            workers: 1,
            poll_interval_s: 1,
            batch_size: 10,
            max_attempts: 3,
            retention_days: 7,
        },
        shutdown,
    )
}

#[tokio::test]
async fn test_enqueue_pending_vs_scheduled() {
    let stack = stack().await;
    let now = chrono::Utc::now().timestamp();

    let immediate = stack
        .queue
        .enqueue(text_payload("s", "15550001111", "hi"), 0, 3, None)
        .await
        .expect("enqueue");
    assert_eq!(immediate.status, JobStatus::Pending);

    let future = stack
        .queue
        .enqueue(
            text_payload("s", "15550001111", "later"),
            0,
            3,
            Some(now + 3600),
        )
        .await
        .expect("enqueue");
    assert_eq!(future.status, JobStatus::Scheduled);

    let past = stack
        .queue
        .enqueue(
            text_payload("s", "15550001111", "overdue"),
            0,
            3,
            Some(now - 60),
        )
        .await
        .expect("enqueue");
    assert_eq!(past.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_claim_orders_by_priority_then_age() {
    let stack = stack().await;
    for (priority, tag) in [(1, "low"), (10, "high"), (5, "mid")] {
        stack
            .queue
            .enqueue(text_payload("s", "15550001111", tag), priority, 3, None)
            .await
            .expect("enqueue");
    }

    let claimed = stack.queue.claim_batch(10).await.expect("claim");
    let priorities: Vec<i64> = claimed.iter().map(|j| j.priority).collect();
    assert_eq!(priorities, vec![10, 5, 1]);
    for job in &claimed {
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());
    }

    // Everything is running now; a second claim finds nothing.
    assert!(stack.queue.claim_batch(10).await.expect("claim").is_empty());
}

#[tokio::test]
async fn test_future_scheduled_jobs_are_not_claimed() {
    let stack = stack().await;
    let now = chrono::Utc::now().timestamp();
    stack
        .queue
        .enqueue(
            text_payload("s", "15550001111", "later"),
            0,
            3,
            Some(now + 3600),
        )
        .await
        .expect("enqueue");
    assert!(stack.queue.claim_batch(10).await.expect("claim").is_empty());
}

#[tokio::test]
async fn test_cancel_only_before_running() {
    let stack = stack().await;
    let job = stack
        .queue
        .enqueue(text_payload("s", "15550001111", "hi"), 0, 3, None)
        .await
        .expect("enqueue");
    let cancelled = stack.queue.cancel(&job.job_id).await.expect("cancel");
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let running = stack
        .queue
        .enqueue(text_payload("s", "15550001111", "hi"), 0, 3, None)
        .await
        .expect("enqueue");
    stack.queue.claim_batch(10).await.expect("claim");
    let err = stack
        .queue
        .cancel(&running.job_id)
        .await
        .expect_err("already running");
    assert!(matches!(err, crate::WamuxError::Conflict(_)));
}

#[tokio::test]
async fn test_fail_requeues_until_attempts_exhausted() {
    let stack = stack().await;
    let job = stack
        .queue
        .enqueue(text_payload("s", "15550001111", "hi"), 0, 2, None)
        .await
        .expect("enqueue");

    stack.queue.claim_batch(10).await.expect("claim");
    let status = stack
        .queue
        .fail(&job.job_id, "boom", false)
        .await
        .expect("fail");
    assert_eq!(status, JobStatus::Pending);

    stack.queue.claim_batch(10).await.expect("claim");
    let status = stack
        .queue
        .fail(&job.job_id, "boom again", false)
        .await
        .expect("fail");
    assert_eq!(status, JobStatus::Failed);

    let stored = stack.queue.get(&job.job_id).await.expect("get");
    assert_eq!(stored.attempts, 2);
    assert!(stored.attempts <= stored.max_attempts);
    assert_eq!(stored.error.as_deref(), Some("boom again"));
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let stack = stack().await;
    let job = stack
        .queue
        .enqueue(text_payload("s", "15550001111", "hi"), 0, 3, None)
        .await
        .expect("enqueue");
    stack.queue.claim_batch(10).await.expect("claim");
    let status = stack
        .queue
        .fail(&job.job_id, "bad payload", true)
        .await
        .expect("fail");
    assert_eq!(status, JobStatus::Failed);
    assert_eq!(stack.queue.get(&job.job_id).await.expect("get").attempts, 1);
}

#[tokio::test]
async fn test_retry_requires_failed_with_remaining_attempts() {
    let stack = stack().await;
    let job = stack
        .queue
        .enqueue(text_payload("s", "15550001111", "hi"), 0, 3, None)
        .await
        .expect("enqueue");
    stack.queue.claim_batch(10).await.expect("claim");
    stack
        .queue
        .fail(&job.job_id, "bad payload", true)
        .await
        .expect("fail");

    // attempts=1 < max_attempts=3, so a manual retry is allowed.
    let retried = stack.queue.retry(&job.job_id).await.expect("retry");
    assert_eq!(retried.status, JobStatus::Pending);

    // A pending job cannot be retried.
    let err = stack.queue.retry(&job.job_id).await.expect_err("not failed");
    assert!(matches!(err, crate::WamuxError::Conflict(_)));
}

#[tokio::test]
async fn test_statistics_and_list_filters() {
    let stack = stack().await;
    stack
        .queue
        .enqueue(text_payload("s", "15550001111", "a"), 0, 3, None)
        .await
        .expect("enqueue");
    let b = stack
        .queue
        .enqueue(text_payload("s", "15550001111", "b"), 0, 3, None)
        .await
        .expect("enqueue");
    stack.queue.cancel(&b.job_id).await.expect("cancel");

    let stats = stack.queue.statistics().await.expect("stats");
    assert_eq!(stats.total, 2);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.cancelled, 1);

    let cancelled = stack
        .queue
        .list(Some(JobStatus::Cancelled), None, 10, 0)
        .await
        .expect("list");
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].job_id, b.job_id);

    let bulk_only = stack
        .queue
        .list(None, Some(JobType::BulkMessage), 10, 0)
        .await
        .expect("list");
    assert!(bulk_only.is_empty());
}

#[tokio::test]
async fn test_cleanup_drops_old_terminal_jobs() {
    let stack = stack().await;
    let job = stack
        .queue
        .enqueue(text_payload("s", "15550001111", "hi"), 0, 3, None)
        .await
        .expect("enqueue");
    stack.queue.cancel(&job.job_id).await.expect("cancel");

    // Backdate the completion to push it past the retention window.
    sqlx::query("UPDATE job_queue SET completed_at = ?2 WHERE job_id = ?1")
        .bind(&job.job_id)
        .bind(chrono::Utc::now().timestamp() - 10 * 86_400)
        .execute(&stack.pool)
        .await
        .expect("backdate");

    let deleted = stack
        .queue
        .cleanup_older_than(std::time::Duration::from_secs(7 * 86_400))
        .await
        .expect("cleanup");
    assert_eq!(deleted, 1);
    assert!(matches!(
        stack.queue.get(&job.job_id).await,
        Err(crate::WamuxError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_release_stale_running_on_startup() {
    let stack = stack().await;
    let job = stack
        .queue
        .enqueue(text_payload("s", "15550001111", "hi"), 0, 3, None)
        .await
        .expect("enqueue");
    stack.queue.claim_batch(10).await.expect("claim");

    let released = stack.queue.release_stale_running().await.expect("release");
    assert_eq!(released, 1);
    assert_eq!(
        stack.queue.get(&job.job_id).await.expect("get").status,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn test_payload_envelope_is_type_tagged() {
    let payload = text_payload("15551234567", "15550001111", "hi");
    let json = serde_json::to_value(&payload).expect("json");
    assert_eq!(json["type"], "scheduled_message");
    let back: JobPayload = serde_json::from_value(json).expect("parse");
    assert_eq!(back.job_type(), JobType::ScheduledMessage);
}

// ---- worker pool ---------------------------------------------------------

#[tokio::test]
async fn test_worker_retry_then_success() {
    let stack = stack().await;
    let session = stack.connected_session("15551234567", &owner()).await;
    stack.sim(&session).fail_next_sends(1);

    let job = stack
        .queue
        .enqueue(text_payload(&session, "15550001111", "hello"), 0, 3, None)
        .await
        .expect("enqueue");

    let pool = pool_for(&stack, CancellationToken::new());
    // First poll: the send fails, the job goes back to pending.
    assert_eq!(pool.poll_once().await.expect("poll"), 1);
    assert_eq!(
        stack.queue.get(&job.job_id).await.expect("get").status,
        JobStatus::Pending
    );
    // Second poll: success.
    assert_eq!(pool.poll_once().await.expect("poll"), 1);

    let done = stack.queue.get(&job.job_id).await.expect("get");
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 2);
    assert!(done.result.is_some());
    assert_eq!(stack.sim(&session).sent().len(), 1);
}

#[tokio::test]
async fn test_worker_dispatches_bulk_payload() {
    let stack = stack().await;
    let session = stack.connected_session("15551234567", &owner()).await;

    let mut ada = Contact::from_phone("15550001111");
    ada.name = "Ada".to_string();
    let mut bo = Contact::from_phone("15550002222");
    bo.name = "Bo".to_string();
    let payload = JobPayload::BulkMessage(BulkMessageSpec {
        session_id: session.clone(),
        message: Some("Hi {{name}}!".to_string()),
        contacts: vec![ada, bo],
        ..Default::default()
    });
    let job = stack
        .queue
        .enqueue(payload, 5, 3, None)
        .await
        .expect("enqueue");

    let pool = pool_for(&stack, CancellationToken::new());
    assert_eq!(pool.poll_once().await.expect("poll"), 1);

    let done = stack.queue.get(&job.job_id).await.expect("get");
    assert_eq!(done.status, JobStatus::Completed);
    let result = done.result.expect("result");
    assert!(result.contains("\"sent\":2"));

    let bodies: Vec<String> = stack
        .sim(&session)
        .sent()
        .iter()
        .map(|r| r.body().to_string())
        .collect();
    assert_eq!(bodies, vec!["Hi Ada!".to_string(), "Hi Bo!".to_string()]);
}

#[tokio::test]
async fn test_worker_marks_unknown_session_failed_permanently() {
    let stack = stack().await;
    let job = stack
        .queue
        .enqueue(text_payload("0000000000", "15550001111", "hi"), 0, 3, None)
        .await
        .expect("enqueue");

    let pool = pool_for(&stack, CancellationToken::new());
    assert_eq!(pool.poll_once().await.expect("poll"), 1);

    let done = stack.queue.get(&job.job_id).await.expect("get");
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.attempts, 1);
    assert!(done.error.is_some());
}
