//! HTTP gateway: router, request types and handlers.

pub mod bulk;
pub mod queue;
pub mod server;
pub mod sessions;
pub mod types;

pub use server::{build_router, start_server, AppState};

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    #[serde(default)]
    expires: i64,
}

/// GET /api/media/temp/{file}?expires={unix} — serve staged inbound media.
/// The expiry in the URL is enforced here; expired links are gone for good.
pub async fn media_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
    Query(query): Query<MediaQuery>,
) -> Response {
    if file.contains('/') || file.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    if query.expires < chrono::Utc::now().timestamp() {
        return StatusCode::GONE.into_response();
    }
    match tokio::fs::read(state.media.path_for(&file)).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests;
