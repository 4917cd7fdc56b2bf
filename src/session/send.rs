//! Outbound operations on a session.
//!
//! Failure semantics: not connected → ServiceUnavailable, connected but not
//! logged in → Unauthorized, invalid recipient → BadRequest. In-crate
//! callers (bulk engine, queue workers, auto-reply) use the `*_raw` variants
//! which skip ownership but keep the connection checks.

use super::{Session, SessionManager, UserCtx};
use crate::error::{Result, WamuxError};
use crate::wa::{
    self, ChatInfo, ChatPresence, GroupInfo, MessagePayload, NumberStatus, PresenceKind,
};
use serde::Serialize;
use std::sync::Arc;

/// Receipt returned by every send operation.
#[derive(Debug, Clone, Serialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub to: String,
    pub timestamp: i64,
}

impl SessionManager {
    /// Resolve a session that is ready to send: connected and logged in.
    async fn sendable(&self, id: &str) -> Result<Arc<Session>> {
        let session = self.session(id).await?;
        if !session.is_connected() {
            return Err(WamuxError::ServiceUnavailable(format!(
                "session {id} is not connected"
            )));
        }
        if !session.is_logged_in() {
            return Err(WamuxError::Unauthorized(format!(
                "session {id} is not logged in"
            )));
        }
        Ok(session)
    }

    async fn owned_sendable(&self, id: &str, caller: &UserCtx) -> Result<Arc<Session>> {
        // Ownership first so foreign sessions stay invisible regardless of
        // their connection state.
        let session = self.session(id).await?;
        if !caller.is_admin && session.owner_user_id != caller.user_id {
            return Err(WamuxError::NotFound(format!("session {id} not found")));
        }
        drop(session);
        self.sendable(id).await
    }

    async fn dispatch_payload(
        &self,
        session: &Arc<Session>,
        to: &str,
        payload: MessagePayload,
    ) -> Result<SendReceipt> {
        let jid = wa::to_jid(to)?;
        let message_id = session
            .client()
            .send_message(&jid, payload)
            .await
            .map_err(WamuxError::from)?;
        Ok(SendReceipt {
            message_id,
            to: jid,
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    // ---- internal sends (ownership already established) -----------------

    pub(crate) async fn send_text_raw(
        &self,
        id: &str,
        to: &str,
        body: &str,
        quoted_message_id: Option<String>,
    ) -> Result<SendReceipt> {
        let session = self.sendable(id).await?;
        self.dispatch_payload(
            &session,
            to,
            MessagePayload::Text {
                body: body.to_string(),
                quoted_message_id,
            },
        )
        .await
    }

    pub(crate) async fn send_file_from_url_raw(
        &self,
        id: &str,
        to: &str,
        url: &str,
        caption: Option<String>,
    ) -> Result<SendReceipt> {
        let session = self.sendable(id).await?;
        let resp = reqwest::get(url)
            .await
            .map_err(|e| WamuxError::BadRequest(format!("failed to fetch {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(WamuxError::BadRequest(format!(
                "failed to fetch {url}: status {}",
                resp.status()
            )));
        }
        let mimetype = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .split(';')
            .next()
            .unwrap_or("application/octet-stream")
            .to_string();
        let filename = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("file")
            .split('?')
            .next()
            .unwrap_or("file")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| WamuxError::BadRequest(format!("failed to read {url}: {e}")))?
            .to_vec();

        let payload = if mimetype.starts_with("image/") {
            MessagePayload::Image {
                bytes,
                mimetype,
                caption,
            }
        } else {
            MessagePayload::Document {
                bytes,
                mimetype,
                filename,
                caption,
            }
        };
        self.dispatch_payload(&session, to, payload).await
    }

    // ---- API sends ------------------------------------------------------

    pub async fn send_text(
        &self,
        id: &str,
        caller: &UserCtx,
        to: &str,
        message: &str,
    ) -> Result<SendReceipt> {
        let session = self.owned_sendable(id, caller).await?;
        self.dispatch_payload(&session, to, MessagePayload::text(message))
            .await
    }

    /// Reply to a previous message by quoting it.
    pub async fn reply(
        &self,
        id: &str,
        caller: &UserCtx,
        to: &str,
        message: &str,
        quoted_message_id: &str,
    ) -> Result<SendReceipt> {
        let session = self.owned_sendable(id, caller).await?;
        self.dispatch_payload(
            &session,
            to,
            MessagePayload::Text {
                body: message.to_string(),
                quoted_message_id: Some(quoted_message_id.to_string()),
            },
        )
        .await
    }

    pub async fn send_image(
        &self,
        id: &str,
        caller: &UserCtx,
        to: &str,
        bytes: Vec<u8>,
        mimetype: &str,
        caption: Option<String>,
    ) -> Result<SendReceipt> {
        if bytes.is_empty() {
            return Err(WamuxError::BadRequest("image payload is empty".to_string()));
        }
        let session = self.owned_sendable(id, caller).await?;
        self.dispatch_payload(
            &session,
            to,
            MessagePayload::Image {
                bytes,
                mimetype: mimetype.to_string(),
                caption,
            },
        )
        .await
    }

    pub async fn send_attachment(
        &self,
        id: &str,
        caller: &UserCtx,
        to: &str,
        bytes: Vec<u8>,
        mimetype: &str,
        filename: &str,
        caption: Option<String>,
    ) -> Result<SendReceipt> {
        if bytes.is_empty() {
            return Err(WamuxError::BadRequest(
                "attachment payload is empty".to_string(),
            ));
        }
        let session = self.owned_sendable(id, caller).await?;
        self.dispatch_payload(
            &session,
            to,
            MessagePayload::Document {
                bytes,
                mimetype: mimetype.to_string(),
                filename: filename.to_string(),
                caption,
            },
        )
        .await
    }

    /// Fetch a file over HTTP and send it as image or document depending on
    /// its content type.
    pub async fn send_file_from_url(
        &self,
        id: &str,
        caller: &UserCtx,
        to: &str,
        url: &str,
        caption: Option<String>,
    ) -> Result<SendReceipt> {
        let _ = self.owned_sendable(id, caller).await?;
        self.send_file_from_url_raw(id, to, url, caption).await
    }

    pub async fn send_location(
        &self,
        id: &str,
        caller: &UserCtx,
        to: &str,
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    ) -> Result<SendReceipt> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(WamuxError::BadRequest(format!(
                "invalid coordinates ({latitude}, {longitude})"
            )));
        }
        let session = self.owned_sendable(id, caller).await?;
        self.dispatch_payload(
            &session,
            to,
            MessagePayload::Location {
                latitude,
                longitude,
                name,
                address,
            },
        )
        .await
    }

    /// Forward a previously received message to another chat.
    pub async fn forward(
        &self,
        id: &str,
        caller: &UserCtx,
        to: &str,
        source_chat: &str,
        message_id: &str,
    ) -> Result<SendReceipt> {
        let session = self.owned_sendable(id, caller).await?;
        self.dispatch_payload(
            &session,
            to,
            MessagePayload::Forward {
                source_chat: source_chat.to_string(),
                message_id: message_id.to_string(),
            },
        )
        .await
    }

    /// Check which of the given numbers are registered on WhatsApp.
    pub async fn check_numbers(
        &self,
        id: &str,
        caller: &UserCtx,
        numbers: &[String],
    ) -> Result<Vec<NumberStatus>> {
        if numbers.is_empty() {
            return Err(WamuxError::BadRequest("no numbers to check".to_string()));
        }
        let session = self.owned_sendable(id, caller).await?;
        let normalized: Vec<String> = numbers
            .iter()
            .map(|n| wa::normalize_phone(n))
            .collect::<Result<_>>()?;
        session
            .client()
            .is_on_whatsapp(&normalized)
            .await
            .map_err(WamuxError::from)
    }

    pub async fn send_typing(
        &self,
        id: &str,
        caller: &UserCtx,
        to: &str,
        state: ChatPresence,
    ) -> Result<()> {
        let session = self.owned_sendable(id, caller).await?;
        let jid = wa::to_jid(to)?;
        session
            .client()
            .send_chat_presence(&jid, state)
            .await
            .map_err(WamuxError::from)
    }

    /// Global presence. Requires a push name, which only exists once paired.
    pub async fn set_presence(
        &self,
        id: &str,
        caller: &UserCtx,
        presence: PresenceKind,
    ) -> Result<()> {
        let session = self.owned_sendable(id, caller).await?;
        if session.client().push_name().is_none() {
            return Err(WamuxError::BadRequest(
                "push name not set; pair the session first".to_string(),
            ));
        }
        session
            .client()
            .send_presence(presence)
            .await
            .map_err(WamuxError::from)
    }

    pub async fn list_groups(&self, id: &str, caller: &UserCtx) -> Result<Vec<GroupInfo>> {
        let session = self.owned_sendable(id, caller).await?;
        session
            .client()
            .joined_groups()
            .await
            .map_err(WamuxError::from)
    }

    pub async fn list_conversations(&self, id: &str, caller: &UserCtx) -> Result<Vec<ChatInfo>> {
        let session = self.owned_sendable(id, caller).await?;
        session
            .client()
            .conversations()
            .await
            .map_err(WamuxError::from)
    }
}
