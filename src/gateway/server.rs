//! HTTP gateway powered by axum.
//!
//! Serves the session, bulk-message and job-queue surfaces plus a health
//! check. Authorization middleware is out of scope; the caller identity
//! arrives in headers and ownership is enforced inside the core.

use super::{bulk, queue, sessions};
use crate::autoreply::AutoReplyEngine;
use crate::bulk::BulkEngine;
use crate::config::{GatewayConfig, QueueConfig};
use crate::media::MediaStore;
use crate::queue::JobQueue;
use crate::session::SessionManager;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Shared state for the gateway.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub bulk: Arc<BulkEngine>,
    pub queue: JobQueue,
    pub autoreply: Arc<AutoReplyEngine>,
    pub media: Arc<MediaStore>,
    pub queue_defaults: QueueConfig,
}

/// Build the axum router for the gateway.
pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    let cors = if allowed_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/sessions",
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route(
            "/sessions/{id}",
            get(sessions::get_session)
                .delete(sessions::delete_session)
                .patch(sessions::update_session),
        )
        .route("/sessions/{id}/connect", post(sessions::connect_session))
        .route(
            "/sessions/{id}/disconnect",
            post(sessions::disconnect_session),
        )
        .route("/sessions/{id}/logout", post(sessions::logout_session))
        .route("/sessions/{id}/pair", post(sessions::pair_session))
        .route("/sessions/{id}/messages", post(sessions::send_message))
        .route("/sessions/{id}/typing", post(sessions::send_typing))
        .route("/sessions/{id}/presence", post(sessions::set_presence))
        .route(
            "/sessions/{id}/check-numbers",
            post(sessions::check_numbers),
        )
        .route("/sessions/{id}/groups", get(sessions::list_groups))
        .route(
            "/sessions/{id}/conversations",
            get(sessions::list_conversations),
        )
        .route(
            "/bulk-messages",
            post(bulk::create_bulk_job).get(bulk::list_bulk_jobs),
        )
        .route(
            "/bulk-messages/{id}",
            get(bulk::get_bulk_job).delete(bulk::delete_bulk_job),
        )
        .route("/bulk-messages/{id}/cancel", post(bulk::cancel_bulk_job))
        .route("/bulk-messages/{id}/pause", post(bulk::pause_bulk_job))
        .route("/bulk-messages/{id}/resume", post(bulk::resume_bulk_job))
        .route("/job-queue", post(queue::enqueue_job).get(queue::list_jobs))
        .route("/job-queue/stats", get(queue::queue_statistics))
        .route(
            "/job-queue/{id}",
            get(queue::get_job).delete(queue::cancel_job),
        )
        .route("/job-queue/{id}/retry", post(queue::retry_job))
        .route("/api/media/temp/{file}", get(super::media_file))
        .layer(cors)
        .with_state(state)
}

/// Serve until the shutdown token fires.
pub async fn start_server(
    config: &GatewayConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = build_router(state, &config.allowed_origins);
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid gateway address: {e}"))?;

    tracing::info!("gateway listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// GET /health — liveness probe.
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "wamux",
        "version": crate::VERSION,
    }))
}
