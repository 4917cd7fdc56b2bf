//! Durable job queue routes.

use super::server::AppState;
use super::types::{EnqueueBody, QueueListQuery};
use crate::error::Result;
use crate::queue::{JobPayload, QueueStatistics, QueuedJob};
use crate::session::UserCtx;
use axum::extract::{Path, Query, State};
use axum::Json;

/// Enqueue deferred or scheduled work.
pub async fn enqueue_job(
    State(state): State<AppState>,
    caller: UserCtx,
    Json(body): Json<EnqueueBody>,
) -> Result<Json<QueuedJob>> {
    let session_id = match &body.payload {
        JobPayload::BulkMessage(spec) => &spec.session_id,
        JobPayload::ScheduledMessage(spec) => &spec.session_id,
    };
    // Ownership gate: the payload must target a session the caller can see.
    state.manager.get(session_id, &caller).await?;

    let max_attempts = body.max_attempts.unwrap_or(state.queue_defaults.max_attempts);
    let job = state
        .queue
        .enqueue(body.payload, body.priority, max_attempts, body.scheduled_at)
        .await?;
    Ok(Json(job))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    _caller: UserCtx,
    Query(query): Query<QueueListQuery>,
) -> Result<Json<Vec<QueuedJob>>> {
    let (status, job_type, limit, offset) = query.parsed()?;
    Ok(Json(state.queue.list(status, job_type, limit, offset).await?))
}

pub async fn queue_statistics(
    State(state): State<AppState>,
    _caller: UserCtx,
) -> Result<Json<QueueStatistics>> {
    Ok(Json(state.queue.statistics().await?))
}

pub async fn get_job(
    State(state): State<AppState>,
    _caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<QueuedJob>> {
    Ok(Json(state.queue.get(&id).await?))
}

/// DELETE cancels: only jobs that have not started running.
pub async fn cancel_job(
    State(state): State<AppState>,
    _caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<QueuedJob>> {
    Ok(Json(state.queue.cancel(&id).await?))
}

pub async fn retry_job(
    State(state): State<AppState>,
    _caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<QueuedJob>> {
    Ok(Json(state.queue.retry(&id).await?))
}
