//! In-process simulator transport.
//!
//! Implements [`WaClient`] without any network: connects instantly, records
//! outbound messages, and lets callers inject inbound events. Used by the
//! test suite and by `transport = "sim"` development runs; production
//! deployments wire a real protocol adapter through [`ClientFactory`].

use super::{
    ChatInfo, ChatPresence, ClientFactory, ClientSpec, ContactEntry, GroupInfo, InboundMessage,
    MediaRef, MessagePayload, NumberStatus, PresenceKind, WaClient, WaError, WaEvent,
    DIRECT_JID_SUFFIX,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One outbound message captured by the simulator.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub jid: String,
    pub payload: MessagePayload,
}

impl SentRecord {
    /// Text body of the record, empty for non-text payloads.
    pub fn body(&self) -> &str {
        match &self.payload {
            MessagePayload::Text { body, .. } => body,
            _ => "",
        }
    }
}

pub struct SimClient {
    session_id: String,
    events: mpsc::UnboundedSender<WaEvent>,
    connected: AtomicBool,
    logged_in: AtomicBool,
    /// Pair immediately on connect, as if credentials were already stored.
    login_on_connect: AtomicBool,
    registered_phone: Mutex<Option<String>>,
    pairing_codes: Mutex<Vec<String>>,
    fail_sends: AtomicU32,
    sent: Mutex<Vec<SentRecord>>,
    msg_counter: AtomicU64,
}

impl SimClient {
    pub fn new(
        spec: ClientSpec,
        events: mpsc::UnboundedSender<WaEvent>,
        login_on_connect: bool,
    ) -> Self {
        // A numeric session id doubles as the registered MSISDN so paired
        // simulators report a believable store id.
        let phone = if spec.session_id.chars().all(|c| c.is_ascii_digit()) {
            spec.session_id.clone()
        } else {
            "15550009999".to_string()
        };
        Self {
            session_id: spec.session_id,
            events,
            connected: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            login_on_connect: AtomicBool::new(login_on_connect),
            registered_phone: Mutex::new(Some(phone)),
            pairing_codes: Mutex::new(vec!["SIM-PAIR-0001".to_string()]),
            fail_sends: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            msg_counter: AtomicU64::new(0),
        }
    }

    /// Push an event into the session's inbound stream.
    pub fn emit(&self, event: WaEvent) {
        let _ = self.events.send(event);
    }

    /// Inject an inbound message as if delivered by the server.
    pub fn emit_message(&self, msg: InboundMessage) {
        self.emit(WaEvent::Message(Box::new(msg)));
    }

    /// Make the next `n` sends fail with a transport error.
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Snapshot of everything sent through this client.
    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Complete a pairing handshake: mark logged in and emit `Connected`
    /// so the manager observes the transition.
    pub fn complete_pairing(&self, phone: &str) {
        *self.registered_phone.lock().expect("phone lock") = Some(phone.to_string());
        self.connected.store(true, Ordering::SeqCst);
        self.logged_in.store(true, Ordering::SeqCst);
        self.emit(WaEvent::Connected);
    }

    /// Simulate a server-side stream error.
    pub fn break_stream(&self, message: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.logged_in.store(false, Ordering::SeqCst);
        self.emit(WaEvent::StreamError {
            message: message.to_string(),
        });
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn next_message_id(&self) -> String {
        let n = self.msg_counter.fetch_add(1, Ordering::SeqCst);
        format!("SIM.{}.{}", self.session_id, n)
    }
}

#[async_trait]
impl WaClient for SimClient {
    async fn connect(&self) -> Result<(), WaError> {
        self.connected.store(true, Ordering::SeqCst);
        if self.login_on_connect.load(Ordering::SeqCst) {
            self.logged_in.store(true, Ordering::SeqCst);
        }
        self.emit(WaEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.logged_in.store(false, Ordering::SeqCst);
        self.emit(WaEvent::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn request_pairing_channel(&self) -> Result<mpsc::Receiver<String>, WaError> {
        if !self.is_connected() {
            return Err(WaError::NotConnected);
        }
        let (tx, rx) = mpsc::channel(4);
        for code in self.pairing_codes.lock().expect("codes lock").iter() {
            let _ = tx.try_send(code.clone());
        }
        Ok(rx)
    }

    async fn logout(&self) -> Result<(), WaError> {
        self.logged_in.store(false, Ordering::SeqCst);
        *self.registered_phone.lock().expect("phone lock") = None;
        self.emit(WaEvent::LoggedOut);
        Ok(())
    }

    async fn send_message(&self, jid: &str, payload: MessagePayload) -> Result<String, WaError> {
        if !self.is_connected() {
            return Err(WaError::NotConnected);
        }
        if !self.is_logged_in() {
            return Err(WaError::NotLoggedIn);
        }
        let remaining = self.fail_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(WaError::Transport("simulated send failure".to_string()));
        }
        self.sent.lock().expect("sent lock").push(SentRecord {
            jid: jid.to_string(),
            payload,
        });
        Ok(self.next_message_id())
    }

    async fn download(&self, media: &MediaRef) -> Result<Vec<u8>, WaError> {
        Ok(format!("sim-media:{}", media.id).into_bytes())
    }

    async fn send_presence(&self, _presence: PresenceKind) -> Result<(), WaError> {
        if !self.is_connected() {
            return Err(WaError::NotConnected);
        }
        Ok(())
    }

    async fn send_chat_presence(&self, _jid: &str, _state: ChatPresence) -> Result<(), WaError> {
        if !self.is_connected() {
            return Err(WaError::NotConnected);
        }
        Ok(())
    }

    async fn subscribe_presence(&self, _jid: &str) -> Result<(), WaError> {
        Ok(())
    }

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, WaError> {
        Ok(vec![])
    }

    async fn all_contacts(&self) -> Result<Vec<ContactEntry>, WaError> {
        Ok(vec![])
    }

    async fn conversations(&self) -> Result<Vec<ChatInfo>, WaError> {
        Ok(vec![])
    }

    async fn is_on_whatsapp(&self, numbers: &[String]) -> Result<Vec<NumberStatus>, WaError> {
        Ok(numbers
            .iter()
            .map(|n| {
                let digits: String = n.chars().filter(char::is_ascii_digit).collect();
                NumberStatus {
                    query: n.clone(),
                    jid: format!("{digits}{DIRECT_JID_SUFFIX}"),
                    is_on_whatsapp: !digits.is_empty(),
                }
            })
            .collect())
    }

    fn store_id(&self) -> Option<String> {
        // Stored credentials exist as soon as the simulator is allowed to
        // pair, mirroring a client with a persisted session database.
        if !self.is_logged_in() && !self.login_on_connect.load(Ordering::SeqCst) {
            return None;
        }
        self.registered_phone
            .lock()
            .expect("phone lock")
            .as_ref()
            .map(|p| format!("{p}:1{DIRECT_JID_SUFFIX}"))
    }

    fn push_name(&self) -> Option<String> {
        if self.is_logged_in() {
            Some(format!("sim-{}", self.session_id))
        } else {
            None
        }
    }
}

/// Factory producing [`SimClient`]s; keeps handles so tests can reach the
/// client behind any session.
pub struct SimClientFactory {
    login_on_connect: bool,
    clients: Mutex<HashMap<String, Arc<SimClient>>>,
}

impl SimClientFactory {
    /// Clients pair immediately on connect, as if credentials were stored.
    pub fn new() -> Self {
        Self {
            login_on_connect: true,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Clients connect without logging in; pairing must be driven explicitly.
    pub fn unpaired() -> Self {
        Self {
            login_on_connect: false,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self, session_id: &str) -> Option<Arc<SimClient>> {
        self.clients
            .lock()
            .expect("clients lock")
            .get(session_id)
            .cloned()
    }
}

impl Default for SimClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactory for SimClientFactory {
    fn create(
        &self,
        spec: ClientSpec,
        events: mpsc::UnboundedSender<WaEvent>,
    ) -> Arc<dyn WaClient> {
        let client = Arc::new(SimClient::new(spec, events, self.login_on_connect));
        self.clients
            .lock()
            .expect("clients lock")
            .insert(client.session_id.clone(), client.clone());
        client
    }
}
