//! The WhatsApp client capability consumed by the session manager.
//!
//! The embedded protocol stack is an external collaborator; the core only
//! sees the [`WaClient`] trait, the event stream a client emits, and the
//! [`ClientFactory`] seam used to build one client per session. Raw client
//! handles never leave the session manager.

pub mod fingerprint;
pub mod sim;

pub use fingerprint::DeviceFingerprint;

use crate::error::WamuxError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Server suffix for direct-chat JIDs.
pub const DIRECT_JID_SUFFIX: &str = "@s.whatsapp.net";

/// Transport-level failures reported by a client.
#[derive(Debug, Error)]
pub enum WaError {
    #[error("client is not connected")]
    NotConnected,
    #[error("client is not logged in")]
    NotLoggedIn,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}

impl From<WaError> for WamuxError {
    fn from(e: WaError) -> Self {
        match e {
            WaError::NotConnected => WamuxError::ServiceUnavailable(e.to_string()),
            WaError::NotLoggedIn => WamuxError::Unauthorized(e.to_string()),
            WaError::Transport(msg) => WamuxError::Internal(format!("transport error: {msg}")),
            WaError::Unsupported(what) => {
                WamuxError::BadRequest(format!("operation not supported: {what}"))
            }
        }
    }
}

/// Lifecycle and message events a client pushes to its session.
#[derive(Debug, Clone)]
pub enum WaEvent {
    Connected,
    Disconnected,
    StreamError { message: String },
    LoggedOut,
    Message(Box<InboundMessage>),
}

/// Message content classification used for webhooks and media handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Audio => "audio",
            MessageKind::Video => "video",
            MessageKind::Document => "document",
            MessageKind::Unknown => "unknown",
        }
    }
}

/// Opaque reference to downloadable media inside an inbound message.
#[derive(Debug, Clone)]
pub struct MediaRef {
    pub id: String,
    pub mimetype: String,
}

/// An inbound message as delivered by the client's event stream.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Provider message id.
    pub id: String,
    /// JID of the chat the message arrived in (group JID for groups).
    pub chat_jid: String,
    /// JID of the actual sender.
    pub sender_jid: String,
    /// Push name the sender advertises.
    pub sender_name: String,
    pub text: String,
    pub kind: MessageKind,
    pub is_group: bool,
    pub is_from_me: bool,
    /// True when the message quotes another message.
    pub is_reply: bool,
    pub media: Option<MediaRef>,
    /// Unix seconds.
    pub timestamp: i64,
}

impl InboundMessage {
    /// Plain direct text message, the common case in tests.
    pub fn text(id: &str, sender_phone: &str, body: &str) -> Self {
        let jid = format!("{sender_phone}{DIRECT_JID_SUFFIX}");
        Self {
            id: id.to_string(),
            chat_jid: jid.clone(),
            sender_jid: jid,
            sender_name: String::new(),
            text: body.to_string(),
            kind: MessageKind::Text,
            is_group: false,
            is_from_me: false,
            is_reply: false,
            media: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Outbound message payloads the core can hand to a client.
#[derive(Debug, Clone)]
pub enum MessagePayload {
    Text {
        body: String,
        /// Set when replying: the id of the quoted message.
        quoted_message_id: Option<String>,
    },
    Image {
        bytes: Vec<u8>,
        mimetype: String,
        caption: Option<String>,
    },
    Document {
        bytes: Vec<u8>,
        mimetype: String,
        filename: String,
        caption: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    Forward {
        source_chat: String,
        message_id: String,
    },
}

impl MessagePayload {
    pub fn text(body: impl Into<String>) -> Self {
        MessagePayload::Text {
            body: body.into(),
            quoted_message_id: None,
        }
    }
}

/// Global presence states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Available,
    Unavailable,
}

/// Per-chat typing indicator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatPresence {
    Composing,
    Paused,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub jid: String,
    pub name: String,
    pub participants: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatInfo {
    pub jid: String,
    pub name: String,
    pub last_message_at: Option<i64>,
    pub unread: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContactEntry {
    pub jid: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NumberStatus {
    pub query: String,
    pub jid: String,
    pub is_on_whatsapp: bool,
}

/// Per-session proxy configuration passed into the client constructor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub proxy_type: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Everything a factory needs to construct one client.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub session_id: String,
    pub fingerprint: DeviceFingerprint,
    pub proxy: Option<ProxyConfig>,
}

/// The capability contract the core consumes. One instance per session.
#[async_trait]
pub trait WaClient: Send + Sync {
    async fn connect(&self) -> Result<(), WaError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn is_logged_in(&self) -> bool;

    /// Open a pairing channel; the receiver yields rotating QR payloads.
    async fn request_pairing_channel(&self) -> Result<mpsc::Receiver<String>, WaError>;
    async fn logout(&self) -> Result<(), WaError>;

    /// Send a message; returns the provider message id.
    async fn send_message(&self, jid: &str, payload: MessagePayload) -> Result<String, WaError>;
    async fn download(&self, media: &MediaRef) -> Result<Vec<u8>, WaError>;

    async fn send_presence(&self, presence: PresenceKind) -> Result<(), WaError>;
    async fn send_chat_presence(&self, jid: &str, state: ChatPresence) -> Result<(), WaError>;
    async fn subscribe_presence(&self, jid: &str) -> Result<(), WaError>;

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, WaError>;
    async fn all_contacts(&self) -> Result<Vec<ContactEntry>, WaError>;
    async fn conversations(&self) -> Result<Vec<ChatInfo>, WaError>;
    async fn is_on_whatsapp(&self, numbers: &[String]) -> Result<Vec<NumberStatus>, WaError>;

    /// Registered MSISDN JID once paired, `None` before.
    fn store_id(&self) -> Option<String>;
    fn push_name(&self) -> Option<String>;
}

/// Builds one client per session. The fingerprint is passed by value;
/// there is no process-wide device singleton.
pub trait ClientFactory: Send + Sync {
    fn create(&self, spec: ClientSpec, events: mpsc::UnboundedSender<WaEvent>)
    -> Arc<dyn WaClient>;
}

/// Normalise a phone number: strip `+`, spaces and dashes, then require
/// 8–15 digits.
pub fn normalize_phone(raw: &str) -> Result<String, WamuxError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-'))
        .collect();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Err(WamuxError::BadRequest(format!(
            "invalid phone number: {raw:?}"
        )));
    }
    if !(8..=15).contains(&cleaned.len()) {
        return Err(WamuxError::BadRequest(format!(
            "phone number must have 8-15 digits, got {}",
            cleaned.len()
        )));
    }
    Ok(cleaned)
}

/// Resolve a recipient to a JID. Anything already carrying a server part
/// (group JIDs in particular) passes through untouched.
pub fn to_jid(recipient: &str) -> Result<String, WamuxError> {
    if recipient.contains('@') {
        return Ok(recipient.to_string());
    }
    Ok(format!("{}{}", normalize_phone(recipient)?, DIRECT_JID_SUFFIX))
}

/// Extract the bare phone digits from a JID.
/// "351933536442:34@s.whatsapp.net" → "351933536442" (linked-device suffix
/// and server part both dropped).
pub fn jid_phone(jid: &str) -> &str {
    let without_server = jid.split('@').next().unwrap_or(jid);
    without_server.split(':').next().unwrap_or(without_server)
}
