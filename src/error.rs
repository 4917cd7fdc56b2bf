//! Core error type shared by every subsystem.
//!
//! Synchronous API paths surface the kind verbatim; background workers
//! convert errors into job status and log.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the session manager, bulk engine, job queue and
/// auto-reply engine.
#[derive(Debug, Error)]
pub enum WamuxError {
    /// Unknown session, job or rule.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid phone, bad trigger config, invalid state transition.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Session is connected but not logged in.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Session is not connected.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Duplicate session id, double connect.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Per-user session limit reached.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Unexpected failure inside a worker or store.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WamuxError>;

impl WamuxError {
    /// Stable machine-readable error code used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            WamuxError::NotFound(_) => "not_found",
            WamuxError::BadRequest(_) => "bad_request",
            WamuxError::Unauthorized(_) => "unauthorized",
            WamuxError::ServiceUnavailable(_) => "service_unavailable",
            WamuxError::Conflict(_) => "conflict",
            WamuxError::QuotaExceeded(_) => "quota_exceeded",
            WamuxError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            WamuxError::NotFound(_) => StatusCode::NOT_FOUND,
            WamuxError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WamuxError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            WamuxError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            WamuxError::Conflict(_) => StatusCode::CONFLICT,
            WamuxError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            WamuxError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for WamuxError {
    fn into_response(self) -> Response {
        if matches!(self, WamuxError::Internal(_)) {
            tracing::error!("request failed: {}", self);
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for WamuxError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => WamuxError::NotFound("record not found".to_string()),
            other => WamuxError::Internal(format!("database error: {other}")),
        }
    }
}

impl From<serde_json::Error> for WamuxError {
    fn from(e: serde_json::Error) -> Self {
        WamuxError::Internal(format!("serialization error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            WamuxError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WamuxError::Conflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            WamuxError::QuotaExceeded("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(WamuxError::BadRequest("x".into()).code(), "bad_request");
        assert_eq!(
            WamuxError::ServiceUnavailable("x".into()).code(),
            "service_unavailable"
        );
    }
}
