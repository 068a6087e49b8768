//! Hosted session transport: the peer dials `/bridge/{topic}` on this server
//! and exchanges JSON frames with the wallet.
//!
//! Peer to wallet: `{ "event": <name>, "error"?: <string|{message}>, "payload"?: <any> }`
//! Wallet to peer: `{ "method": <name>, "params"?: <any> }`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use relay_core::errors::TransportError;
use relay_core::events::TransportEventName;
use relay_core::request::{ApprovedResponse, RejectedResponse};
use relay_core::session::{SessionCapabilities, SessionState};
use relay_core::transport::{RawCallback, SessionHandle, SessionTransport};
use relay_core::uri::PairingUri;

/// Peer frames held while nobody listens for their event.
const MAX_BACKLOG: usize = 64;

#[derive(Debug, Deserialize)]
pub struct PeerFrame {
    pub event: String,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub payload: Value,
}

impl PeerFrame {
    fn transport_error(&self) -> Option<TransportError> {
        let message = match self.error.as_ref()? {
            Value::Null => return None,
            Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| other.to_string(), str::to_owned),
        };
        Some(TransportError::remote(message))
    }
}

#[derive(Debug, Serialize)]
struct WalletFrame {
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// What `session_state` persists and `restore` reads back.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    topic: String,
    connected: bool,
    #[serde(default)]
    accounts: Vec<String>,
    #[serde(default)]
    chain_id: Option<u64>,
}

struct PeerLink {
    id: u64,
    tx: mpsc::Sender<String>,
}

type Backlogged = (TransportEventName, Option<TransportError>, Value);

type Topics = DashMap<String, Arc<HostedHandle>>;

pub struct HostedHandle {
    topic: String,
    /// Built by `create`/`restore` rather than by a peer dialing in first.
    claimed: bool,
    topics: Weak<Topics>,
    connected: watch::Sender<bool>,
    accounts: Mutex<Vec<String>>,
    chain_id: Mutex<Option<u64>>,
    link: Mutex<Option<PeerLink>>,
    listeners: Mutex<HashMap<TransportEventName, Vec<RawCallback>>>,
    backlog: Mutex<Vec<Backlogged>>,
    negotiation_timeout: Duration,
}

impl HostedHandle {
    fn new(topic: String, claimed: bool, topics: Weak<Topics>, negotiation_timeout: Duration) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            topic,
            claimed,
            topics,
            connected,
            accounts: Mutex::new(Vec::new()),
            chain_id: Mutex::new(None),
            link: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
            backlog: Mutex::new(Vec::new()),
            negotiation_timeout,
        }
    }

    pub fn peer_attached(&self) -> bool {
        self.link.lock().is_some()
    }

    /// Deliver a raw event to every listener for `name`, or hold it until
    /// negotiation starts when there are none.
    pub fn emit(&self, name: TransportEventName, error: Option<TransportError>, payload: Value) {
        let listeners = self.listeners.lock().get(&name).cloned().unwrap_or_default();
        if listeners.is_empty() {
            let mut backlog = self.backlog.lock();
            if backlog.len() < MAX_BACKLOG {
                backlog.push((name, error, payload));
            } else {
                warn!(topic = %self.topic, event = %name, "peer backlog full, dropping event");
            }
            return;
        }
        for listener in listeners {
            listener(error.clone(), payload.clone());
        }
    }

    fn replay_backlog(&self) {
        let held = std::mem::take(&mut *self.backlog.lock());
        if !held.is_empty() {
            debug!(topic = %self.topic, count = held.len(), "replaying held peer events");
        }
        for (name, error, payload) in held {
            self.emit(name, error, payload);
        }
    }

    fn deliver(&self, frame: PeerFrame) {
        let name = match frame.event.parse::<TransportEventName>() {
            Ok(name) => name,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "ignoring peer frame");
                return;
            }
        };
        let error = frame.transport_error();
        self.emit(name, error, frame.payload);
    }

    fn send(&self, method: &'static str, params: Option<Value>) -> Result<(), TransportError> {
        let text = serde_json::to_string(&WalletFrame { method, params })
            .map_err(|e| TransportError::remote(e.to_string()))?;
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            return Err(TransportError::PeerUnavailable);
        };
        match link.tx.try_send(text) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %self.topic, method, "peer send queue full");
                Err(TransportError::remote("peer send queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn capabilities_payload(&self) -> Value {
        json!({
            "params": [{
                "accounts": *self.accounts.lock(),
                "chainId": *self.chain_id.lock(),
            }]
        })
    }

    /// Remove this handle from its transport's topic table.
    fn release(&self) {
        if let Some(topics) = self.topics.upgrade() {
            topics.remove_if(&self.topic, |_, h| std::ptr::eq(Arc::as_ptr(h), self));
        }
    }

    /// Move the peer link and any held events from `old` into `self`.
    fn adopt(&self, old: &HostedHandle) {
        *self.link.lock() = old.link.lock().take();
        self.backlog.lock().append(&mut old.backlog.lock());
    }
}

#[async_trait]
impl SessionHandle for HostedHandle {
    fn connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn accounts(&self) -> Vec<String> {
        self.accounts.lock().clone()
    }

    fn chain_id(&self) -> Option<u64> {
        *self.chain_id.lock()
    }

    fn session_state(&self) -> SessionState {
        let stored = StoredSession {
            topic: self.topic.clone(),
            connected: self.connected(),
            accounts: self.accounts(),
            chain_id: self.chain_id(),
        };
        SessionState(serde_json::to_value(stored).unwrap_or(Value::Null))
    }

    /// Wait for the peer's session request to be approved.
    async fn create_session(&self) -> Result<(), TransportError> {
        if self.connected() {
            return Ok(());
        }
        let mut rx = self.connected.subscribe();
        self.replay_backlog();
        let outcome = match tokio::time::timeout(self.negotiation_timeout, rx.wait_for(|c| *c)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(self.negotiation_timeout)),
        };
        outcome
    }

    async fn approve_session(&self, capabilities: SessionCapabilities) -> Result<(), TransportError> {
        self.send("approveSession", Some(json!(capabilities)))?;
        *self.accounts.lock() = capabilities.accounts;
        *self.chain_id.lock() = Some(capabilities.chain_id);
        self.connected.send_replace(true);
        info!(topic = %self.topic, "session approved");
        self.emit(TransportEventName::Connect, None, self.capabilities_payload());
        Ok(())
    }

    async fn kill_session(&self) -> Result<(), TransportError> {
        let sent = self.send("killSession", None);
        self.connected.send_replace(false);
        self.emit(
            TransportEventName::Disconnect,
            None,
            json!({ "message": "Session disconnected" }),
        );
        self.release();
        match sent {
            Err(TransportError::PeerUnavailable) => Ok(()),
            other => other,
        }
    }

    async fn approve_request(&self, response: ApprovedResponse) -> Result<(), TransportError> {
        self.send("approveRequest", Some(json!(response)))
    }

    async fn reject_request(&self, response: RejectedResponse) -> Result<(), TransportError> {
        self.send("rejectRequest", Some(json!(response)))
    }

    fn on(&self, event: TransportEventName, callback: RawCallback) {
        self.listeners.lock().entry(event).or_default().push(callback);
    }
}

/// Session transport whose peers connect to this process over WebSocket,
/// one handle per pairing topic.
pub struct HostedTransport {
    topics: Arc<Topics>,
    negotiation_timeout: Duration,
    max_send_queue: usize,
    next_link: AtomicU64,
}

impl HostedTransport {
    pub fn new(negotiation_timeout: Duration, max_send_queue: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            negotiation_timeout,
            max_send_queue,
            next_link: AtomicU64::new(1),
        }
    }

    pub fn handle(&self, topic: &str) -> Option<Arc<HostedHandle>> {
        self.topics.get(topic).map(|h| Arc::clone(h.value()))
    }

    fn new_handle(&self, topic: String, claimed: bool) -> HostedHandle {
        HostedHandle::new(topic, claimed, Arc::downgrade(&self.topics), self.negotiation_timeout)
    }

    /// Install a fresh handle for `topic`, taking over whatever peer link the
    /// previous one had. Handles from earlier pairings on other topics are
    /// dropped; only one session is live at a time.
    fn install(&self, handle: HostedHandle) -> Arc<HostedHandle> {
        let handle = Arc::new(handle);
        self.topics.retain(|topic, h| topic == &handle.topic || !h.claimed);
        if let Some(old) = self.topics.insert(handle.topic.clone(), Arc::clone(&handle)) {
            handle.adopt(&old);
        }
        handle
    }

    /// Bind a peer socket to `topic`. Returns the link id and the frames
    /// queued for that peer.
    pub fn attach(&self, topic: &str) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let handle = self
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| Arc::new(self.new_handle(topic.to_owned(), false)))
            .clone();
        let replaced = handle.link.lock().replace(PeerLink { id, tx }).is_some();
        info!(topic, link = id, replaced, "peer attached");
        handle.emit(TransportEventName::TransportOpen, None, json!({ "topic": topic }));
        (id, rx)
    }

    /// Unbind link `id`, unless a newer socket already replaced it. A handle
    /// no pairing ever claimed goes away with its last socket.
    pub fn detach(&self, topic: &str, id: u64) {
        let Some(handle) = self.handle(topic) else {
            return;
        };
        let removed = {
            let mut link = handle.link.lock();
            if link.as_ref().is_some_and(|l| l.id == id) {
                link.take();
                true
            } else {
                false
            }
        };
        if removed {
            info!(topic, link = id, "peer detached");
            handle.emit(TransportEventName::TransportClose, None, json!({ "topic": topic }));
            if !handle.claimed {
                self.topics.remove_if(topic, |_, h| Arc::ptr_eq(h, &handle));
            }
        }
    }

    /// Route a raw text frame from the peer on `topic`.
    pub fn deliver(&self, topic: &str, text: &str) {
        let frame: PeerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(topic, error = %e, "malformed peer frame");
                return;
            }
        };
        if let Some(handle) = self.handle(topic) {
            handle.deliver(frame);
        }
    }
}

#[async_trait]
impl SessionTransport for HostedTransport {
    async fn create(&self, uri: &str) -> Result<Arc<dyn SessionHandle>, TransportError> {
        let pairing = PairingUri::parse(uri)?;
        debug!(topic = %pairing.topic, version = pairing.version, "creating hosted session");
        let handle = self.install(self.new_handle(pairing.topic, true));
        Ok(handle)
    }

    async fn restore(&self, state: &SessionState) -> Result<Arc<dyn SessionHandle>, TransportError> {
        let stored: StoredSession = serde_json::from_value(state.0.clone())
            .map_err(|e| TransportError::remote(format!("unreadable session state: {e}")))?;
        let handle = self.new_handle(stored.topic, true);
        *handle.accounts.lock() = stored.accounts;
        *handle.chain_id.lock() = stored.chain_id;
        handle.connected.send_replace(stored.connected);
        Ok(self.install(handle))
    }
}

/// Pump one peer socket for `topic` until either side closes.
pub async fn handle_peer_socket(socket: WebSocket, topic: String, transport: Arc<HostedTransport>) {
    let (link_id, mut rx) = transport.attach(&topic);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let reader_topic = topic.clone();
    let reader_transport = Arc::clone(&transport);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => reader_transport.deliver(&reader_topic, text.as_str()),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    transport.detach(&topic, link_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use relay_core::request::RequestId;

    fn transport() -> HostedTransport {
        HostedTransport::new(Duration::from_millis(200), 8)
    }

    fn recorder(handle: &HostedHandle, name: TransportEventName) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        handle.on(name, Arc::new(move |_, payload| sink.lock().push(payload)));
        seen
    }

    fn frames(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn create_rejects_bad_uri() {
        let t = transport();
        assert_matches!(t.create("http://nope").await.err(), Some(TransportError::InvalidUri(_)));
    }

    #[tokio::test]
    async fn peer_frames_reach_listeners() {
        let t = transport();
        let handle = t.create("wc:topic1@1").await.unwrap();
        let hosted = t.handle("topic1").unwrap();
        let seen = recorder(&hosted, TransportEventName::CallRequest);
        let (_link, _rx) = t.attach("topic1");

        t.deliver("topic1", r#"{"event":"call_request","payload":{"id":1,"method":"m","params":[]}}"#);
        t.deliver("topic1", r#"{"event":"bogus"}"#);
        t.deliver("topic1", "not json");

        assert_eq!(seen.lock().len(), 1);
        assert!(!handle.connected());
    }

    #[tokio::test]
    async fn frame_errors_become_transport_errors() {
        let t = transport();
        t.create("wc:t@1").await.unwrap();
        let hosted = t.handle("t").unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        hosted.on(
            TransportEventName::CallRequest,
            Arc::new(move |err, _| sink.lock().push(err)),
        );

        t.deliver("t", r#"{"event":"call_request","error":"boom"}"#);
        t.deliver("t", r#"{"event":"call_request","error":{"message":"nested"}}"#);
        t.deliver("t", r#"{"event":"call_request","error":null}"#);

        assert_eq!(
            *errors.lock(),
            vec![
                Some(TransportError::remote("boom")),
                Some(TransportError::remote("nested")),
                None
            ]
        );
    }

    #[tokio::test]
    async fn negotiation_completes_on_approval() {
        let t = Arc::new(transport());
        let handle = t.create("wc:neg@1").await.unwrap();
        let (_link, mut rx) = t.attach("neg");
        let connects = recorder(&t.handle("neg").unwrap(), TransportEventName::Connect);

        let waiting = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.create_session().await })
        };
        tokio::task::yield_now().await;
        handle
            .approve_session(SessionCapabilities::new(3, vec!["0xabc".into()]))
            .await
            .unwrap();

        assert!(waiting.await.unwrap().is_ok());
        assert!(handle.connected());
        assert_eq!(handle.accounts(), vec!["0xabc"]);
        assert_eq!(
            frames(&mut rx),
            vec![json!({"method": "approveSession", "params": {"chainId": 3, "accounts": ["0xabc"]}})]
        );
        assert_eq!(
            *connects.lock(),
            vec![json!({"params": [{"accounts": ["0xabc"], "chainId": 3}]})]
        );
    }

    #[tokio::test]
    async fn negotiation_times_out() {
        let t = transport();
        let handle = t.create("wc:slow@1").await.unwrap();
        assert_matches!(handle.create_session().await, Err(TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn early_peer_events_replayed_at_negotiation() {
        let t = transport();
        let (_link, _rx) = t.attach("early");
        t.deliver("early", r#"{"event":"session_request","payload":{"peerId":"dapp"}}"#);

        let handle = t.create("wc:early@1").await.unwrap();
        let hosted = t.handle("early").unwrap();
        assert!(hosted.peer_attached());
        let requests = recorder(&hosted, TransportEventName::SessionRequest);

        // Nobody approves, so this times out after replaying.
        let _ = handle.create_session().await;
        assert_eq!(*requests.lock(), vec![json!({"peerId": "dapp"})]);
    }

    #[tokio::test]
    async fn responses_need_a_peer() {
        let t = transport();
        let handle = t.create("wc:r@1").await.unwrap();
        let approved = ApprovedResponse {
            id: RequestId::from(1u64),
            result: json!("0x1"),
        };
        assert_matches!(
            handle.approve_request(approved.clone()).await,
            Err(TransportError::PeerUnavailable)
        );

        let (_link, mut rx) = t.attach("r");
        handle.approve_request(approved).await.unwrap();
        handle
            .reject_request(RejectedResponse::cancelled(RequestId::from(2u64)))
            .await
            .unwrap();
        assert_eq!(
            frames(&mut rx),
            vec![
                json!({"method": "approveRequest", "params": {"id": 1, "result": "0x1"}}),
                json!({"method": "rejectRequest", "params": {"id": 2, "error": {"message": "cancelled"}}}),
            ]
        );
    }

    #[tokio::test]
    async fn kill_session_notifies_peer_and_listeners() {
        let t = transport();
        let handle = t.create("wc:k@1").await.unwrap();
        let disconnects = recorder(&t.handle("k").unwrap(), TransportEventName::Disconnect);
        let (_link, mut rx) = t.attach("k");

        handle.kill_session().await.unwrap();
        assert!(!handle.connected());
        assert_eq!(frames(&mut rx), vec![json!({"method": "killSession"})]);
        assert_eq!(disconnects.lock().len(), 1);
        assert!(t.handle("k").is_none());
    }

    #[tokio::test]
    async fn unclaimed_topics_leave_with_their_socket() {
        let t = transport();
        for n in 0..500 {
            let topic = format!("drive-by-{n}");
            let (link, _rx) = t.attach(&topic);
            t.deliver(&topic, r#"{"event":"session_request","payload":{}}"#);
            t.detach(&topic, link);
        }
        assert!(t.topics.is_empty());
    }

    #[tokio::test]
    async fn claimed_topic_survives_socket_loss() {
        let t = transport();
        t.create("wc:keep@1").await.unwrap();
        let (link, _rx) = t.attach("keep");
        t.detach("keep", link);
        assert!(t.handle("keep").is_some());
    }

    #[tokio::test]
    async fn new_pairing_drops_previous_topic() {
        let t = transport();
        t.create("wc:first@1").await.unwrap();
        let (_link, _rx) = t.attach("waiting");
        t.create("wc:second@1").await.unwrap();

        assert!(t.handle("first").is_none());
        assert!(t.handle("second").is_some());
        // A peer that dialed in ahead of its pairing is left alone.
        assert!(t.handle("waiting").is_some());
        assert_eq!(t.topics.len(), 2);
    }

    #[tokio::test]
    async fn link_lifecycle_events() {
        let t = transport();
        t.create("wc:l@1").await.unwrap();
        let hosted = t.handle("l").unwrap();
        let opens = recorder(&hosted, TransportEventName::TransportOpen);
        let closes = recorder(&hosted, TransportEventName::TransportClose);

        let (first, _rx1) = t.attach("l");
        let (second, _rx2) = t.attach("l");
        t.detach("l", first);
        assert_eq!(closes.lock().len(), 0);
        t.detach("l", second);

        assert_eq!(opens.lock().len(), 2);
        assert_eq!(closes.lock().len(), 1);
        assert!(!hosted.peer_attached());
    }

    #[tokio::test]
    async fn session_state_round_trips_through_restore() {
        let t = transport();
        let handle = t.create("wc:p@1").await.unwrap();
        let (_link, _rx) = t.attach("p");
        handle
            .approve_session(SessionCapabilities::new(5, vec!["0x5".into()]))
            .await
            .unwrap();
        let state = handle.session_state();
        assert_eq!(
            state.0,
            json!({"topic": "p", "connected": true, "accounts": ["0x5"], "chainId": 5})
        );

        let fresh = transport();
        let restored = fresh.restore(&state).await.unwrap();
        assert!(restored.connected());
        assert_eq!(restored.chain_id(), Some(5));

        assert_matches!(
            fresh.restore(&SessionState(json!({"nope": 1}))).await.err(),
            Some(TransportError::Remote { .. })
        );
    }
}
