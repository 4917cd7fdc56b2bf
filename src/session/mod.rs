//! Session manager: owns every live WhatsApp session, drives lifecycle
//! transitions, dispatches inbound events, and enforces the policy gate
//! that decides whether auto-reply and webhooks fire.
//!
//! All client handles live behind this module; other components talk to
//! sessions exclusively through the manager.

pub mod send;
pub mod store;

pub use store::{SessionRecord, SessionStore};

use crate::autoreply::AutoReplyEngine;
use crate::config::SessionConfig;
use crate::error::{Result, WamuxError};
use crate::media::MediaStore;
use crate::wa::{
    self, ClientFactory, ClientSpec, DeviceFingerprint, InboundMessage, MessagePayload, WaClient,
    WaEvent,
};
use crate::webhook::{WebhookDispatcher, WebhookEvent};
use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Caller identity attached to every mutating call. Authorization middleware
/// lives outside the core, but ownership is enforced here regardless.
#[derive(Debug, Clone)]
pub struct UserCtx {
    pub user_id: String,
    pub is_admin: bool,
}

impl UserCtx {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: id.into(),
            is_admin: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            user_id: id.into(),
            is_admin: true,
        }
    }
}

/// Request to create a session.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    /// Phone to use as the session id; a synthetic 10-digit id is generated
    /// when absent.
    pub phone: Option<String>,
    pub name: String,
    pub position: String,
    pub webhook_url: Option<String>,
    pub auto_reply_text: Option<String>,
    pub proxy: Option<wa::ProxyConfig>,
}

/// Per-session inbound hook, invoked before the policy gate.
pub type MessageHandler =
    Arc<dyn Fn(Arc<Session>, InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct RuntimeFlags {
    connected: AtomicBool,
    logged_in: AtomicBool,
    connecting: AtomicBool,
}

/// One live session: durable record plus runtime state and the client
/// handle. Runtime flags are only ever written by the manager.
pub struct Session {
    pub id: String,
    pub owner_user_id: String,
    pub fingerprint: DeviceFingerprint,
    record: RwLock<SessionRecord>,
    flags: RuntimeFlags,
    client: Arc<dyn WaClient>,
    event_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::SeqCst)
    }

    pub fn is_logged_in(&self) -> bool {
        self.flags.logged_in.load(Ordering::SeqCst)
    }

    pub fn is_connecting(&self) -> bool {
        self.flags.connecting.load(Ordering::SeqCst)
    }

    pub async fn record(&self) -> SessionRecord {
        self.record.read().await.clone()
    }

    pub(crate) fn client(&self) -> &Arc<dyn WaClient> {
        &self.client
    }

    fn abort_event_task(&self) {
        if let Some(task) = self.event_task.lock().expect("event task lock").take() {
            task.abort();
        }
    }
}

/// API-facing snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: String,
    pub phone: String,
    pub actual_phone: Option<String>,
    pub name: String,
    pub position: String,
    pub webhook_url: Option<String>,
    pub auto_reply_text: Option<String>,
    pub enabled: bool,
    pub user_id: String,
    pub connected: bool,
    pub logged_in: bool,
    pub connecting: bool,
    pub device: String,
    pub created_at: i64,
    pub updated_at: i64,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    store: SessionStore,
    factory: Arc<dyn ClientFactory>,
    config: SessionConfig,
    webhook: WebhookDispatcher,
    media: Arc<MediaStore>,
    auto_reply: OnceLock<Arc<AutoReplyEngine>>,
}

impl SessionManager {
    pub fn new(
        pool: SqlitePool,
        factory: Arc<dyn ClientFactory>,
        config: SessionConfig,
        webhook: WebhookDispatcher,
        media: Arc<MediaStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            store: SessionStore::new(pool),
            factory,
            config,
            webhook,
            media,
            auto_reply: OnceLock::new(),
        })
    }

    /// Wire the auto-reply engine after construction. Called once at startup.
    pub fn attach_auto_reply(&self, engine: Arc<AutoReplyEngine>) {
        if self.auto_reply.set(engine).is_err() {
            tracing::warn!("auto-reply engine attached twice, keeping the first");
        }
    }

    // ---- lifecycle ------------------------------------------------------

    /// Create a session and register its client. The metadata write and the
    /// in-memory registration happen under the table's write lock.
    pub async fn create(
        self: &Arc<Self>,
        req: CreateSessionRequest,
        caller: &UserCtx,
    ) -> Result<SessionView> {
        let id = match &req.phone {
            Some(phone) => wa::normalize_phone(phone)?,
            None => generate_session_id(),
        };

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(WamuxError::Conflict(format!("session {id} already exists")));
        }
        if !caller.is_admin {
            let owned = sessions
                .values()
                .filter(|s| s.owner_user_id == caller.user_id)
                .count();
            if owned >= self.config.max_sessions_per_user {
                return Err(WamuxError::QuotaExceeded(format!(
                    "user {} already has {} sessions",
                    caller.user_id, owned
                )));
            }
        }

        let now = chrono::Utc::now().timestamp();
        let record = SessionRecord {
            id: id.clone(),
            phone: id.clone(),
            actual_phone: None,
            name: req.name,
            position: req.position,
            webhook_url: req.webhook_url,
            auto_reply_text: req.auto_reply_text,
            proxy: req.proxy,
            enabled: true,
            user_id: caller.user_id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.upsert(&record).await?;
        let session = self.register_locked(&mut sessions, record);
        drop(sessions);

        tracing::info!(
            "session {} created for user {} (device {})",
            session.id,
            caller.user_id,
            session.fingerprint.label()
        );
        Ok(self.view(&session).await)
    }

    /// Re-register every persisted session after a restart. Sessions come
    /// back DOWN; enabled ones with stored credentials are reconnected in
    /// the background.
    pub async fn restore_sessions(self: &Arc<Self>) -> Result<usize> {
        let records = self.store.load_all().await?;
        let mut sessions = self.sessions.write().await;
        let mut restored = 0;
        for record in records {
            if sessions.contains_key(&record.id) {
                continue;
            }
            let enabled = record.enabled;
            let session = self.register_locked(&mut sessions, record);
            if enabled && session.client.store_id().is_some() {
                let client = session.client.clone();
                let id = session.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.connect().await {
                        tracing::warn!("session {id}: reconnect after restore failed: {e}");
                    }
                });
            }
            restored += 1;
        }
        tracing::info!("restored {restored} sessions from store");
        Ok(restored)
    }

    fn register_locked(
        self: &Arc<Self>,
        sessions: &mut HashMap<String, Arc<Session>>,
        record: SessionRecord,
    ) -> Arc<Session> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let fingerprint = DeviceFingerprint::random();
        let spec = ClientSpec {
            session_id: record.id.clone(),
            fingerprint,
            proxy: record.proxy.clone(),
        };
        let client = self.factory.create(spec, events_tx);
        let session = Arc::new(Session {
            id: record.id.clone(),
            owner_user_id: record.user_id.clone(),
            fingerprint,
            record: RwLock::new(record),
            flags: RuntimeFlags::default(),
            client,
            event_task: std::sync::Mutex::new(None),
        });
        self.spawn_event_task(&session, events_rx);
        sessions.insert(session.id.clone(), session.clone());
        session
    }

    fn spawn_event_task(
        self: &Arc<Self>,
        session: &Arc<Session>,
        mut events: mpsc::UnboundedReceiver<WaEvent>,
    ) {
        let manager = Arc::downgrade(self);
        let session_task = session.clone();
        let handle = tokio::spawn(async move {
            // Events for one session are processed strictly in delivery
            // order; the manager never reorders them.
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.dispatch_event(&session_task, event).await;
            }
        });
        *session.event_task.lock().expect("event task lock") = Some(handle);
    }

    /// Connect a session and wait until the transition is complete: the
    /// client must report connected *and* the connected event must have been
    /// observed. Times out non-fatally; the session stays DOWN.
    pub async fn connect(&self, id: &str, caller: &UserCtx) -> Result<SessionView> {
        let session = self.owned_session(id, caller).await?;
        if !session.record.read().await.enabled {
            return Err(WamuxError::BadRequest(format!("session {id} is disabled")));
        }
        if session.is_connected() {
            return Err(WamuxError::Conflict(format!(
                "session {id} is already connected"
            )));
        }
        if session.flags.connecting.swap(true, Ordering::SeqCst) {
            return Err(WamuxError::Conflict(format!(
                "session {id} connect already in progress"
            )));
        }

        let client = session.client.clone();
        let connect_id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.connect().await {
                tracing::warn!("session {connect_id}: connect failed: {e}");
            }
        });

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.connect_timeout_s);
        let result = loop {
            if session.is_connected() && session.client.is_connected() {
                break Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break Err(WamuxError::ServiceUnavailable(format!(
                    "session {id} connect timed out after {}s",
                    self.config.connect_timeout_s
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        };
        session.flags.connecting.store(false, Ordering::SeqCst);
        result?;
        Ok(self.view(&session).await)
    }

    pub async fn disconnect(&self, id: &str, caller: &UserCtx) -> Result<()> {
        let session = self.owned_session(id, caller).await?;
        session.client.disconnect().await;
        session.flags.connected.store(false, Ordering::SeqCst);
        session.flags.logged_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Log the session out and clear the registered phone from the durable
    /// record.
    pub async fn logout(&self, id: &str, caller: &UserCtx) -> Result<()> {
        let session = self.owned_session(id, caller).await?;
        session
            .client
            .logout()
            .await
            .map_err(|e| WamuxError::Internal(format!("logout failed: {e}")))?;
        session.flags.logged_in.store(false, Ordering::SeqCst);
        let mut record = session.record.write().await;
        record.actual_phone = None;
        record.updated_at = chrono::Utc::now().timestamp();
        self.store.upsert(&record).await?;
        Ok(())
    }

    /// Delete a session: disconnect if needed, drop it from memory and from
    /// the durable store.
    pub async fn delete(&self, id: &str, caller: &UserCtx) -> Result<()> {
        let session = {
            let _ = self.owned_session(id, caller).await?;
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(id)
                .ok_or_else(|| WamuxError::NotFound(format!("session {id} not found")))?
        };
        self.handlers.write().await.remove(id);
        if session.is_connected() {
            session.client.disconnect().await;
        }
        session.abort_event_task();
        self.store.delete(id).await?;
        tracing::info!("session {id} deleted");
        Ok(())
    }

    /// Open the pairing channel and return the first QR payload.
    pub async fn request_pairing_code(&self, id: &str, caller: &UserCtx) -> Result<String> {
        let session = self.owned_session(id, caller).await?;
        if !session.record.read().await.enabled {
            return Err(WamuxError::BadRequest(format!("session {id} is disabled")));
        }
        let mut channel = session
            .client
            .request_pairing_channel()
            .await
            .map_err(WamuxError::from)?;
        let timeout = Duration::from_secs(self.config.pairing_timeout_s);
        match tokio::time::timeout(timeout, channel.recv()).await {
            Ok(Some(code)) => Ok(code),
            Ok(None) => Err(WamuxError::ServiceUnavailable(
                "pairing channel closed".to_string(),
            )),
            Err(_) => Err(WamuxError::ServiceUnavailable(format!(
                "no pairing code within {}s",
                self.config.pairing_timeout_s
            ))),
        }
    }

    // ---- metadata -------------------------------------------------------

    pub async fn update_metadata(
        &self,
        id: &str,
        caller: &UserCtx,
        name: Option<String>,
        position: Option<String>,
    ) -> Result<SessionView> {
        let session = self.owned_session(id, caller).await?;
        {
            let mut record = session.record.write().await;
            if let Some(name) = name {
                record.name = name;
            }
            if let Some(position) = position {
                record.position = position;
            }
            record.updated_at = chrono::Utc::now().timestamp();
            self.store.upsert(&record).await?;
        }
        Ok(self.view(&session).await)
    }

    /// Set or clear the webhook URL (empty string clears).
    pub async fn update_webhook(
        &self,
        id: &str,
        caller: &UserCtx,
        webhook_url: Option<String>,
    ) -> Result<SessionView> {
        let session = self.owned_session(id, caller).await?;
        {
            let mut record = session.record.write().await;
            record.webhook_url = webhook_url.filter(|u| !u.is_empty());
            record.updated_at = chrono::Utc::now().timestamp();
            self.store.upsert(&record).await?;
        }
        Ok(self.view(&session).await)
    }

    /// Set or clear the static auto-reply text (empty string clears).
    pub async fn update_auto_reply_text(
        &self,
        id: &str,
        caller: &UserCtx,
        text: Option<String>,
    ) -> Result<SessionView> {
        let session = self.owned_session(id, caller).await?;
        {
            let mut record = session.record.write().await;
            record.auto_reply_text = text.filter(|t| !t.is_empty());
            record.updated_at = chrono::Utc::now().timestamp();
            self.store.upsert(&record).await?;
        }
        Ok(self.view(&session).await)
    }

    /// Flip the policy flag. Enabling a session with stored credentials
    /// reconnects it in the background.
    pub async fn set_enabled(&self, id: &str, caller: &UserCtx, enabled: bool) -> Result<SessionView> {
        let session = self.owned_session(id, caller).await?;
        {
            let mut record = session.record.write().await;
            record.enabled = enabled;
            record.updated_at = chrono::Utc::now().timestamp();
            self.store.upsert(&record).await?;
        }
        if enabled && !session.is_connected() && session.client.store_id().is_some() {
            let client = session.client.clone();
            let reconnect_id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = client.connect().await {
                    tracing::warn!("session {reconnect_id}: auto-connect failed: {e}");
                }
            });
        }
        Ok(self.view(&session).await)
    }

    // ---- lookups --------------------------------------------------------

    pub async fn get(&self, id: &str, caller: &UserCtx) -> Result<SessionView> {
        let session = self.owned_session(id, caller).await?;
        Ok(self.view(&session).await)
    }

    /// Sessions visible to the caller: their own, or all for admins.
    pub async fn list(&self, caller: &UserCtx) -> Vec<SessionView> {
        let sessions: Vec<Arc<Session>> = {
            let map = self.sessions.read().await;
            map.values()
                .filter(|s| caller.is_admin || s.owner_user_id == caller.user_id)
                .cloned()
                .collect()
        };
        let mut views = Vec::with_capacity(sessions.len());
        for session in sessions {
            views.push(self.view(&session).await);
        }
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        views
    }

    pub async fn is_owned_by(&self, id: &str, user_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(id)
            .is_some_and(|s| s.owner_user_id == user_id)
    }

    /// Register a per-session inbound handler, replacing any existing one.
    pub async fn set_message_handler(&self, id: &str, handler: MessageHandler) {
        self.handlers.write().await.insert(id.to_string(), handler);
    }

    pub async fn clear_message_handler(&self, id: &str) {
        self.handlers.write().await.remove(id);
    }

    pub(crate) async fn session(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| WamuxError::NotFound(format!("session {id} not found")))
    }

    async fn owned_session(&self, id: &str, caller: &UserCtx) -> Result<Arc<Session>> {
        let session = self.session(id).await?;
        if !caller.is_admin && session.owner_user_id != caller.user_id {
            // Foreign sessions are invisible, not forbidden.
            return Err(WamuxError::NotFound(format!("session {id} not found")));
        }
        Ok(session)
    }

    async fn view(&self, session: &Arc<Session>) -> SessionView {
        let record = session.record.read().await;
        SessionView {
            id: record.id.clone(),
            phone: record.phone.clone(),
            actual_phone: record.actual_phone.clone(),
            name: record.name.clone(),
            position: record.position.clone(),
            webhook_url: record.webhook_url.clone(),
            auto_reply_text: record.auto_reply_text.clone(),
            enabled: record.enabled,
            user_id: record.user_id.clone(),
            connected: session.is_connected(),
            logged_in: session.is_logged_in(),
            connecting: session.is_connecting(),
            device: session.fingerprint.label(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    // ---- event dispatch -------------------------------------------------

    async fn dispatch_event(self: &Arc<Self>, session: &Arc<Session>, event: WaEvent) {
        match event {
            WaEvent::Connected => {
                // Trust the event only if the client agrees.
                if !session.client.is_connected() {
                    tracing::warn!(
                        "session {}: connected event but client reports disconnected",
                        session.id
                    );
                    return;
                }
                let logged_in = session.client.is_logged_in();
                // Persist the registered phone before the flags flip, so a
                // caller waiting on the connect sees a settled record.
                if logged_in
                    && let Some(store_id) = session.client.store_id()
                {
                    let phone = wa::jid_phone(&store_id).to_string();
                    let mut record = session.record.write().await;
                    if record.actual_phone.as_deref() != Some(phone.as_str()) {
                        record.actual_phone = Some(phone);
                        record.updated_at = chrono::Utc::now().timestamp();
                        if let Err(e) = self.store.upsert(&record).await {
                            tracing::error!(
                                "session {}: failed to persist registered phone: {e}",
                                session.id
                            );
                        }
                    }
                }
                session.flags.connected.store(true, Ordering::SeqCst);
                session.flags.logged_in.store(logged_in, Ordering::SeqCst);
                tracing::info!(
                    "session {}: connected (logged_in={logged_in})",
                    session.id
                );
            }
            WaEvent::Disconnected => {
                session.flags.connected.store(false, Ordering::SeqCst);
                session.flags.logged_in.store(false, Ordering::SeqCst);
                tracing::warn!("session {}: disconnected", session.id);
            }
            WaEvent::StreamError { message } => {
                session.flags.connected.store(false, Ordering::SeqCst);
                session.flags.logged_in.store(false, Ordering::SeqCst);
                tracing::warn!("session {}: stream error: {message}", session.id);
            }
            WaEvent::LoggedOut => {
                session.flags.logged_in.store(false, Ordering::SeqCst);
                let mut record = session.record.write().await;
                record.actual_phone = None;
                record.updated_at = chrono::Utc::now().timestamp();
                if let Err(e) = self.store.upsert(&record).await {
                    tracing::error!("session {}: failed to persist logout: {e}", session.id);
                }
                tracing::warn!("session {}: logged out", session.id);
            }
            WaEvent::Message(msg) => {
                self.dispatch_message(session, *msg).await;
            }
        }
    }

    async fn dispatch_message(self: &Arc<Self>, session: &Arc<Session>, msg: InboundMessage) {
        // Registered inbound handlers run before the policy gate.
        let handler = self.handlers.read().await.get(&session.id).cloned();
        if let Some(handler) = handler {
            handler(session.clone(), msg.clone()).await;
        }

        let record = session.record.read().await.clone();
        if !record.enabled {
            tracing::debug!(
                "session {}: disabled, dropping inbound side effects",
                session.id
            );
            return;
        }

        // Simple static reply: direct, non-self, non-reply messages only.
        if let Some(text) = record.auto_reply_text.as_deref()
            && !text.is_empty()
            && !msg.is_from_me
            && !msg.is_group
            && !msg.is_reply
        {
            if let Err(e) = session
                .client
                .send_message(&msg.chat_jid, MessagePayload::text(text))
                .await
            {
                tracing::warn!("session {}: static auto-reply failed: {e}", session.id);
            }
        }

        if let Some(url) = record.webhook_url.clone().filter(|u| !u.is_empty()) {
            let media_url = match &msg.media {
                Some(media) => self.stash_media(session, &msg.id, media).await,
                None => None,
            };
            let event = WebhookEvent {
                session_id: session.id.clone(),
                from: wa::jid_phone(&msg.sender_jid).to_string(),
                from_name: msg.sender_name.clone(),
                to: record.actual_phone.clone().unwrap_or_else(|| record.phone.clone()),
                timestamp: msg.timestamp,
                id: msg.id.clone(),
                is_group: msg.is_group,
                group_id: msg.is_group.then(|| msg.chat_jid.clone()),
                message_type: msg.kind,
                message: msg.text.clone(),
                media_url,
            };
            self.webhook.spawn_delivery(url, event);
        }

        // Rule-based auto-reply runs last, independent of the static reply.
        if let Some(engine) = self.auto_reply.get() {
            engine.handle_inbound(session, &msg).await;
        }
    }

    /// Download inbound media and stage it under the media directory.
    /// Best-effort: a failed download only costs the webhook its media_url.
    async fn stash_media(
        &self,
        session: &Arc<Session>,
        message_id: &str,
        media: &crate::wa::MediaRef,
    ) -> Option<String> {
        let bytes = match session.client.download(media).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("session {}: media download failed: {e}", session.id);
                return None;
            }
        };
        match self
            .media
            .store_inbound(&session.id, message_id, &media.mimetype, &bytes)
            .await
        {
            Ok(stored) => Some(stored.url),
            Err(e) => {
                tracing::warn!("session {}: media store failed: {e}", session.id);
                None
            }
        }
    }
}

/// Synthetic 10-digit session id for sessions created without a phone.
fn generate_session_id() -> String {
    let mut rng = rand::rng();
    let mut id = String::with_capacity(10);
    id.push(char::from(b'1' + rng.random_range(0..9u8)));
    for _ in 0..9 {
        id.push(char::from(b'0' + rng.random_range(0..10u8)));
    }
    id
}
