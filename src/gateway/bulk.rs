//! Bulk messaging routes.

use super::server::AppState;
use super::types::DeletedResponse;
use crate::bulk::{BulkJobView, BulkMessageSpec};
use crate::error::{Result, WamuxError};
use crate::session::UserCtx;
use axum::extract::{Path, State};
use axum::Json;

/// Start a bulk job immediately; the deferred path goes through the queue.
pub async fn create_bulk_job(
    State(state): State<AppState>,
    caller: UserCtx,
    Json(spec): Json<BulkMessageSpec>,
) -> Result<Json<BulkJobView>> {
    // Ownership gate before the engine touches anything.
    state.manager.get(&spec.session_id, &caller).await?;
    Ok(Json(state.bulk.start(&spec).await?))
}

pub async fn list_bulk_jobs(
    State(state): State<AppState>,
    caller: UserCtx,
) -> Result<Json<Vec<BulkJobView>>> {
    let mut jobs = state.bulk.list().await;
    if !caller.is_admin {
        let mut visible = Vec::with_capacity(jobs.len());
        for job in jobs {
            if state.manager.is_owned_by(&job.session_id, &caller.user_id).await {
                visible.push(job);
            }
        }
        jobs = visible;
    }
    Ok(Json(jobs))
}

pub async fn get_bulk_job(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<BulkJobView>> {
    let job = state.bulk.get(&id).await?;
    ensure_visible(&state, &caller, &job).await?;
    Ok(Json(job))
}

pub async fn cancel_bulk_job(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<BulkJobView>> {
    let job = state.bulk.get(&id).await?;
    ensure_visible(&state, &caller, &job).await?;
    Ok(Json(state.bulk.cancel(&id).await?))
}

pub async fn pause_bulk_job(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<BulkJobView>> {
    let job = state.bulk.get(&id).await?;
    ensure_visible(&state, &caller, &job).await?;
    Ok(Json(state.bulk.pause(&id).await?))
}

pub async fn resume_bulk_job(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<BulkJobView>> {
    let job = state.bulk.get(&id).await?;
    ensure_visible(&state, &caller, &job).await?;
    Ok(Json(state.bulk.resume(&id).await?))
}

pub async fn delete_bulk_job(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>> {
    let job = state.bulk.get(&id).await?;
    ensure_visible(&state, &caller, &job).await?;
    state.bulk.delete(&id).await?;
    Ok(Json(DeletedResponse { deleted: true }))
}

async fn ensure_visible(state: &AppState, caller: &UserCtx, job: &BulkJobView) -> Result<()> {
    if caller.is_admin || state.manager.is_owned_by(&job.session_id, &caller.user_id).await {
        Ok(())
    } else {
        Err(WamuxError::NotFound(format!(
            "bulk job {} not found",
            job.id
        )))
    }
}
