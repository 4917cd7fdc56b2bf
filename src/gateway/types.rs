//! Request and response bodies for the HTTP gateway.

use crate::error::WamuxError;
use crate::queue::{JobStatus, JobType};
use crate::session::UserCtx;
use crate::wa::ProxyConfig;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};

/// Caller identity, injected by the (out-of-scope) auth middleware as
/// `X-User-Id` / `X-User-Role` headers. Ownership checks inside the core do
/// not rely on the middleware being the only line of defence.
impl<S> FromRequestParts<S> for UserCtx
where
    S: Send + Sync,
{
    type Rejection = WamuxError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WamuxError::Unauthorized("missing X-User-Id header".to_string()))?;
        let is_admin = parts
            .headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|role| role.eq_ignore_ascii_case("admin"));
        Ok(Self {
            user_id: user_id.to_string(),
            is_admin,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub auto_reply_text: Option<String>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

/// PATCH body; only present fields are applied. Empty strings clear the
/// optional text fields.
#[derive(Debug, Deserialize)]
pub struct UpdateSessionBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub auto_reply_text: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Outbound message request, dispatched on `message_type`.
#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub to: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Base64 payload for image/document sends.
    #[serde(default)]
    pub media_base64: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    /// Source URL for `url` sends.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    /// Quoted message id for `reply` sends.
    #[serde(default)]
    pub quoted_message_id: Option<String>,
    /// Source chat and message id for `forward` sends.
    #[serde(default)]
    pub source_chat: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

fn default_message_type() -> String {
    "text".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TypingBody {
    pub to: String,
    /// "composing" or "paused".
    pub state: crate::wa::ChatPresence,
}

#[derive(Debug, Deserialize)]
pub struct PresenceBody {
    /// "available" or "unavailable".
    pub presence: crate::wa::PresenceKind,
}

#[derive(Debug, Deserialize)]
pub struct CheckNumbersBody {
    pub numbers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PairResponse {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

/// Enqueue body for the durable queue: the typed payload envelope plus
/// scheduling knobs.
#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    #[serde(flatten)]
    pub payload: crate::queue::JobPayload,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub scheduled_at: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "type")]
    pub job_type: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl QueueListQuery {
    pub fn parsed(&self) -> Result<(Option<JobStatus>, Option<JobType>, i64, i64), WamuxError> {
        let status = match &self.status {
            Some(s) => Some(
                JobStatus::parse(s)
                    .ok_or_else(|| WamuxError::BadRequest(format!("unknown status {s:?}")))?,
            ),
            None => None,
        };
        let job_type = match &self.job_type {
            Some(t) => Some(
                JobType::parse(t)
                    .ok_or_else(|| WamuxError::BadRequest(format!("unknown job type {t:?}")))?,
            ),
            None => None,
        };
        Ok((
            status,
            job_type,
            self.limit.unwrap_or(50),
            self.offset.unwrap_or(0),
        ))
    }
}
