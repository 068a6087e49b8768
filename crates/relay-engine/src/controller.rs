//! Owner of the single live session.
//!
//! Installing a handle always clears the queue and rebinds the bridge in one
//! step, and every transition to disconnected clears the queue, the stored
//! connect URI, and the persisted session blob.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};

use relay_core::events::{TransportEventName, WalletEvent};
use relay_core::ids::SessionId;
use relay_core::request::{
    CallRequest, Decision, DuplicatePolicy, RejectedResponse, DUPLICATE_MESSAGE,
};
use relay_core::resolver::RequestResolver;
use relay_core::session::{
    capabilities_from_payload, ConnectionStatus, SessionCapabilities, SessionSnapshot,
    SessionState,
};
use relay_core::transport::{SessionHandle, SessionTransport};
use relay_store::KeyValueStore;

use crate::bridge::{BridgeEvent, SessionEventBridge};
use crate::error::{EngineError, HandlerError};
use crate::queue::{EnqueueOutcome, PendingRequestQueue, QueueSnapshot, Target};

/// Store key holding the transport's session blob.
pub const SESSION_KEY: &str = "session";

const EVENT_CAPACITY: usize = 256;

struct ActiveSession {
    id: SessionId,
    handle: Arc<dyn SessionHandle>,
    generation: u64,
}

#[derive(Default)]
struct ControllerState {
    status: ConnectionStatus,
    session: Option<ActiveSession>,
    connect_uri: Option<String>,
    accounts: Vec<String>,
    chain_id: Option<u64>,
}

pub struct SessionLifecycleController {
    transport: Arc<dyn SessionTransport>,
    store: Arc<dyn KeyValueStore>,
    bridge: SessionEventBridge,
    queue: PendingRequestQueue,
    capabilities: SessionCapabilities,
    state: Mutex<ControllerState>,
    events: broadcast::Sender<WalletEvent>,
    /// Bumped by every `connect` and `disconnect`.
    attempts: watch::Sender<u64>,
}

impl SessionLifecycleController {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        resolver: Arc<dyn RequestResolver>,
        store: Arc<dyn KeyValueStore>,
        capabilities: SessionCapabilities,
        policy: DuplicatePolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let bridge = SessionEventBridge::new();
            for name in TransportEventName::ALL {
                let weak = weak.clone();
                bridge.subscribe(name, move |event| match weak.upgrade() {
                    Some(this) => this.on_event(event),
                    None => Ok(()),
                });
            }
            Self {
                transport,
                store,
                bridge,
                queue: PendingRequestQueue::new(resolver, policy, events.clone()),
                capabilities,
                state: Mutex::new(ControllerState::default()),
                events,
                attempts: watch::channel(0).0,
            }
        })
    }

    // ── Observers ────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        snapshot_of(&self.state.lock())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn pending(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn queue(&self) -> &PendingRequestQueue {
        &self.queue
    }

    pub fn bridge(&self) -> &SessionEventBridge {
        &self.bridge
    }

    pub fn capabilities(&self) -> &SessionCapabilities {
        &self.capabilities
    }

    pub fn has_session(&self) -> bool {
        self.state.lock().session.is_some()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Pair through `uri`, replacing any current session.
    ///
    /// A resumed pairing skips negotiation. A later `connect` or `disconnect`
    /// ends a pending negotiation with [`EngineError::Superseded`]. When
    /// pairing fails with no other session live, the controller is left
    /// disconnected but keeps `uri` for [`reconnect`].
    ///
    /// [`reconnect`]: Self::reconnect
    #[instrument(skip(self, uri))]
    pub async fn connect(&self, uri: impl Into<String>) -> Result<SessionSnapshot, EngineError> {
        let uri = uri.into();
        let attempt = self.next_attempt();

        let handle = match self.transport.create(&uri).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(kind = e.error_kind(), error = %e, "session construction failed");
                self.keep_for_retry(attempt, uri);
                return Err(EngineError::Lifecycle(e));
            }
        };
        if !self.is_current(attempt) {
            debug!(attempt, "connect superseded before install");
            return Err(EngineError::Superseded);
        }

        let session_id = self.install(Arc::clone(&handle), Some(uri));

        if handle.connected() {
            info!(session_id = %session_id, "pairing resumed, skipping negotiation");
        } else {
            let negotiated = tokio::select! {
                result = handle.create_session() => result,
                () = self.superseded(attempt) => {
                    debug!(session_id = %session_id, attempt, "connect superseded during negotiation");
                    self.discard(&session_id);
                    return Err(EngineError::Superseded);
                }
            };
            if let Err(e) = negotiated {
                warn!(session_id = %session_id, kind = e.error_kind(), error = %e, "session negotiation failed");
                self.discard(&session_id);
                return Err(EngineError::Lifecycle(e));
            }
        }

        if !self.mark_connected(&session_id) {
            return Err(EngineError::Superseded);
        }
        Ok(self.snapshot())
    }

    /// Retry with the connect URI kept from the last attempt.
    pub async fn reconnect(&self) -> Result<SessionSnapshot, EngineError> {
        let uri = self
            .state
            .lock()
            .connect_uri
            .clone()
            .ok_or(EngineError::NoConnectUri)?;
        self.connect(uri).await
    }

    /// Rebuild the session persisted by a previous run, if any.
    ///
    /// Ends connected only when the transport reports the restored handle
    /// connected; otherwise the stale blob is removed.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<SessionSnapshot, EngineError> {
        if self.has_session() {
            return Ok(self.snapshot());
        }
        let Some(blob) = self.store.get(SESSION_KEY)? else {
            debug!("no persisted session");
            return Ok(self.snapshot());
        };

        match self.transport.restore(&SessionState(blob)).await {
            Ok(handle) if handle.connected() => {
                let session_id = self.install(handle, None);
                self.mark_connected(&session_id);
                info!(session_id = %session_id, "session restored");
            }
            Ok(_) => {
                info!("persisted session is no longer connected, discarding");
                self.store.remove(SESSION_KEY)?;
            }
            Err(e) => {
                warn!(kind = e.error_kind(), error = %e, "session restore failed, discarding");
                self.store.remove(SESSION_KEY)?;
            }
        }
        Ok(self.snapshot())
    }

    /// Kill the current session and tear down local state.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> SessionSnapshot {
        self.next_attempt();
        if let Some(session) = self.teardown() {
            if let Err(e) = session.handle.kill_session().await {
                warn!(session_id = %session.id, error = %e, "kill session failed");
            }
        }
        self.snapshot()
    }

    // ── Decisions ────────────────────────────────────────────────────

    pub async fn approve(&self, target: impl Into<Target>) -> Result<Decision, EngineError> {
        let handle = self.current_handle()?;
        self.queue.approve(target.into(), handle.as_ref()).await
    }

    pub async fn reject(&self, target: impl Into<Target>) -> Result<CallRequest, EngineError> {
        let handle = self.current_handle()?;
        self.queue.reject(target.into(), handle.as_ref()).await
    }

    fn current_handle(&self) -> Result<Arc<dyn SessionHandle>, EngineError> {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|s| Arc::clone(&s.handle))
            .ok_or(EngineError::NotConnected)
    }

    // ── Connect attempts ─────────────────────────────────────────────

    fn next_attempt(&self) -> u64 {
        let mut attempt = 0;
        self.attempts.send_modify(|n| {
            *n += 1;
            attempt = *n;
        });
        attempt
    }

    fn is_current(&self, attempt: u64) -> bool {
        *self.attempts.borrow() == attempt
    }

    /// Resolves once a newer attempt has started.
    async fn superseded(&self, attempt: u64) {
        let mut attempts = self.attempts.subscribe();
        loop {
            if *attempts.borrow_and_update() != attempt {
                return;
            }
            if attempts.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Remember `uri` after a failed construction, unless a newer attempt
    /// started or another session is still live.
    fn keep_for_retry(&self, attempt: u64, uri: String) {
        {
            let mut state = self.state.lock();
            if state.session.is_some() || !self.is_current(attempt) {
                return;
            }
            state.connect_uri = Some(uri);
        }
        self.emit_session();
    }

    // ── State transitions ────────────────────────────────────────────

    /// Swap in `handle` as the only session: queue cleared, bridge rebound,
    /// status disconnected until confirmed.
    fn install(&self, handle: Arc<dyn SessionHandle>, uri: Option<String>) -> SessionId {
        let session_id = SessionId::new();
        {
            let mut state = self.state.lock();
            self.queue.clear();
            let generation = self.bridge.rebind(Some(Arc::clone(&handle)));
            if uri.is_some() {
                state.connect_uri = uri;
            }
            state.status = ConnectionStatus::Disconnected;
            state.accounts = Vec::new();
            state.chain_id = None;
            state.session = Some(ActiveSession {
                id: session_id.clone(),
                handle,
                generation,
            });
            info!(session_id = %session_id, generation, "session installed");
        }
        self.emit_session();
        session_id
    }

    /// Drop a session that never got connected. The connect URI stays.
    fn discard(&self, session_id: &SessionId) {
        {
            let mut state = self.state.lock();
            if state.session.as_ref().map(|s| &s.id) != Some(session_id) {
                return;
            }
            state.session = None;
            state.status = ConnectionStatus::Disconnected;
            self.bridge.detach();
            self.queue.clear();
        }
        self.forget_persisted();
        self.emit_session();
    }

    /// Enter connected if `session_id` is still the current session.
    fn mark_connected(&self, session_id: &SessionId) -> bool {
        let blob = {
            let mut state = self.state.lock();
            let Some(session) = state.session.as_ref().filter(|s| &s.id == session_id) else {
                debug!(session_id = %session_id, "session replaced before it connected");
                return false;
            };
            let handle = Arc::clone(&session.handle);
            state.status = ConnectionStatus::Connected;
            state.accounts = handle.accounts();
            state.chain_id = handle.chain_id();
            handle.session_state()
        };
        info!(session_id = %session_id, "session connected");
        self.persist(&blob);
        self.emit_session();
        true
    }

    /// Back to disconnected. Pending requests are dropped unanswered.
    fn teardown(&self) -> Option<ActiveSession> {
        let (session, changed) = {
            let mut state = self.state.lock();
            let changed = state.session.is_some()
                || state.status.is_connected()
                || state.connect_uri.is_some();
            let session = state.session.take();
            state.status = ConnectionStatus::Disconnected;
            state.connect_uri = None;
            state.accounts = Vec::new();
            state.chain_id = None;
            self.bridge.detach();
            let discarded = self.queue.clear();
            if let Some(session) = &session {
                info!(session_id = %session.id, discarded, "session torn down");
            }
            (session, changed)
        };
        self.forget_persisted();
        if changed {
            self.emit_session();
        }
        session
    }

    fn persist(&self, blob: &SessionState) {
        if let Err(e) = self.store.set(SESSION_KEY, &blob.0) {
            warn!(kind = e.error_kind(), error = %e, "failed to persist session");
        }
    }

    fn forget_persisted(&self) {
        if let Err(e) = self.store.remove(SESSION_KEY) {
            warn!(kind = e.error_kind(), error = %e, "failed to remove persisted session");
        }
    }

    fn emit_session(&self) {
        let _ = self.events.send(WalletEvent::SessionChanged {
            snapshot: self.snapshot(),
        });
    }

    // ── Transport events ─────────────────────────────────────────────

    fn on_event(&self, event: &BridgeEvent) -> Result<(), HandlerError> {
        let Some((session_id, handle)) = self.session_for(event.generation) else {
            debug!(event = %event.name, generation = event.generation, "event for inactive session");
            return Ok(());
        };

        match event.name {
            TransportEventName::CallRequest => self.on_call_request(&session_id, handle, event),
            TransportEventName::Connect => {
                if self.mark_connected(&session_id) && self.on_session_update(event) {
                    self.emit_session();
                }
                Ok(())
            }
            TransportEventName::Disconnect => {
                info!(session_id = %session_id, "peer disconnected");
                self.teardown();
                Ok(())
            }
            TransportEventName::SessionRequest | TransportEventName::WcSessionRequest => {
                self.approve_session_request(session_id, handle);
                Ok(())
            }
            TransportEventName::SessionUpdate | TransportEventName::WcSessionUpdate => {
                self.on_session_update(event);
                if self.status().is_connected() {
                    self.persist(&handle.session_state());
                }
                self.emit_session();
                Ok(())
            }
            TransportEventName::Error => {
                debug!(session_id = %session_id, payload = %event.payload, "transport error observed");
                Ok(())
            }
            TransportEventName::TransportOpen | TransportEventName::TransportClose => {
                debug!(session_id = %session_id, event = %event.name, "transport link changed");
                Ok(())
            }
        }
    }

    fn session_for(&self, generation: u64) -> Option<(SessionId, Arc<dyn SessionHandle>)> {
        let state = self.state.lock();
        state
            .session
            .as_ref()
            .filter(|s| s.generation == generation)
            .map(|s| (s.id.clone(), Arc::clone(&s.handle)))
    }

    fn on_call_request(
        &self,
        session_id: &SessionId,
        handle: Arc<dyn SessionHandle>,
        event: &BridgeEvent,
    ) -> Result<(), HandlerError> {
        let request: CallRequest = serde_json::from_value(event.payload.clone())?;
        debug!(session_id = %session_id, request_id = %request.id, method = %request.method, "call request received");

        if self.queue.enqueue(request.clone()) == EnqueueOutcome::Duplicate {
            spawn_outbound("reject duplicate", async move {
                handle
                    .reject_request(RejectedResponse::new(request.id, DUPLICATE_MESSAGE))
                    .await
            });
        }
        Ok(())
    }

    /// Apply `{accounts, chainId}` from a lifecycle payload, if present.
    fn on_session_update(&self, event: &BridgeEvent) -> bool {
        let Some(caps) = capabilities_from_payload(&event.payload) else {
            return false;
        };
        let mut state = self.state.lock();
        state.accounts = caps.accounts;
        state.chain_id = Some(caps.chain_id);
        true
    }

    fn approve_session_request(&self, session_id: SessionId, handle: Arc<dyn SessionHandle>) {
        let capabilities = self.capabilities.clone();
        info!(session_id = %session_id, chain_id = capabilities.chain_id, "auto-approving session request");
        spawn_outbound("approve session", async move {
            handle.approve_session(capabilities).await
        });
    }
}

fn snapshot_of(state: &ControllerState) -> SessionSnapshot {
    SessionSnapshot {
        status: state.status,
        session_id: state.session.as_ref().map(|s| s.id.clone()),
        accounts: state.accounts.clone(),
        chain_id: state.chain_id,
        connect_uri: state.connect_uri.clone(),
    }
}

/// Run an outbound transport call from a synchronous event handler.
fn spawn_outbound<F>(what: &'static str, call: F)
where
    F: std::future::Future<Output = Result<(), relay_core::errors::TransportError>> + Send + 'static,
{
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        error!(call = what, "no async runtime for outbound call");
        return;
    };
    runtime.spawn(async move {
        if let Err(e) = call.await {
            warn!(call = what, kind = e.error_kind(), error = %e, "outbound call failed");
        }
    });
}
