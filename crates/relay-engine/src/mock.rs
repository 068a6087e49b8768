//! Scriptable transport and resolver doubles for deterministic tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use relay_core::errors::{ResolverError, TransportError};
use relay_core::events::TransportEventName;
use relay_core::request::{ApprovedResponse, CallRequest, RejectedResponse};
use relay_core::resolver::RequestResolver;
use relay_core::session::{SessionCapabilities, SessionState};
use relay_core::transport::{RawCallback, SessionHandle, SessionTransport};

/// One call the relay made on a handle.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    ApproveSession(SessionCapabilities),
    KillSession,
    ApproveRequest(ApprovedResponse),
    RejectRequest(RejectedResponse),
}

/// Session handle that records every outbound call and lets tests emit raw
/// `(error, payload)` events.
pub struct MockHandle {
    connected: AtomicBool,
    accounts: Mutex<Vec<String>>,
    chain_id: Mutex<Option<u64>>,
    state: Value,
    listeners: Mutex<HashMap<TransportEventName, Vec<RawCallback>>>,
    outbound: Mutex<Vec<Outbound>>,
    negotiations: AtomicUsize,
    negotiation_failure: Mutex<Option<TransportError>>,
    negotiation_gate: Mutex<Option<Arc<Notify>>>,
    send_failure: Mutex<Option<TransportError>>,
}

impl MockHandle {
    /// Freshly constructed, not yet negotiated.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false, json!({ "mock": true })))
    }

    /// Already connected, as when a pairing is resumed.
    pub fn resumed(accounts: Vec<String>, chain_id: u64) -> Arc<Self> {
        let handle = Self::build(true, json!({ "mock": true, "resumed": true }));
        *handle.accounts.lock() = accounts;
        *handle.chain_id.lock() = Some(chain_id);
        Arc::new(handle)
    }

    /// Reports `state` from `session_state()`.
    pub fn with_state(state: Value, connected: bool) -> Arc<Self> {
        Arc::new(Self::build(connected, state))
    }

    fn build(connected: bool, state: Value) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            accounts: Mutex::new(Vec::new()),
            chain_id: Mutex::new(None),
            state,
            listeners: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Vec::new()),
            negotiations: AtomicUsize::new(0),
            negotiation_failure: Mutex::new(None),
            negotiation_gate: Mutex::new(None),
            send_failure: Mutex::new(None),
        }
    }

    /// Make the next `create_session` fail with `err`.
    pub fn fail_negotiation(&self, err: TransportError) {
        *self.negotiation_failure.lock() = Some(err);
    }

    /// Hold `create_session` open until `gate` is notified.
    pub fn hold_negotiation(&self, gate: Arc<Notify>) {
        *self.negotiation_gate.lock() = Some(gate);
    }

    /// Make every outbound request response fail with `err` (still recorded).
    pub fn fail_sends(&self, err: TransportError) {
        *self.send_failure.lock() = Some(err);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Invoke every listener registered for `name`, in registration order.
    pub fn emit(&self, name: TransportEventName, error: Option<TransportError>, payload: Value) {
        let listeners = self.listeners.lock().get(&name).cloned().unwrap_or_default();
        for listener in listeners {
            listener(error.clone(), payload.clone());
        }
    }

    /// Emit a `call_request` carrying `request`.
    pub fn emit_call(&self, request: &CallRequest) {
        let payload = serde_json::to_value(request).unwrap_or(Value::Null);
        self.emit(TransportEventName::CallRequest, None, payload);
    }

    pub fn outbound(&self) -> Vec<Outbound> {
        self.outbound.lock().clone()
    }

    pub fn negotiations(&self) -> usize {
        self.negotiations.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self, name: TransportEventName) -> usize {
        self.listeners.lock().get(&name).map_or(0, Vec::len)
    }

    fn record(&self, call: Outbound) {
        self.outbound.lock().push(call);
    }

    fn send_result(&self) -> Result<(), TransportError> {
        match self.send_failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SessionHandle for MockHandle {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn accounts(&self) -> Vec<String> {
        self.accounts.lock().clone()
    }

    fn chain_id(&self) -> Option<u64> {
        *self.chain_id.lock()
    }

    fn session_state(&self) -> SessionState {
        SessionState(self.state.clone())
    }

    async fn create_session(&self) -> Result<(), TransportError> {
        self.negotiations.fetch_add(1, Ordering::SeqCst);
        let gate = self.negotiation_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.negotiation_failure.lock().take() {
            return Err(err);
        }
        self.set_connected(true);
        Ok(())
    }

    async fn approve_session(&self, capabilities: SessionCapabilities) -> Result<(), TransportError> {
        *self.accounts.lock() = capabilities.accounts.clone();
        *self.chain_id.lock() = Some(capabilities.chain_id);
        self.set_connected(true);
        self.record(Outbound::ApproveSession(capabilities));
        Ok(())
    }

    async fn kill_session(&self) -> Result<(), TransportError> {
        self.set_connected(false);
        self.record(Outbound::KillSession);
        Ok(())
    }

    async fn approve_request(&self, response: ApprovedResponse) -> Result<(), TransportError> {
        self.record(Outbound::ApproveRequest(response));
        self.send_result()
    }

    async fn reject_request(&self, response: RejectedResponse) -> Result<(), TransportError> {
        self.record(Outbound::RejectRequest(response));
        self.send_result()
    }

    fn on(&self, event: TransportEventName, callback: RawCallback) {
        self.listeners.lock().entry(event).or_default().push(callback);
    }
}

/// Transport handing out pre-scripted handles in order.
#[derive(Default)]
pub struct MockTransport {
    created: Mutex<VecDeque<Result<Arc<MockHandle>, TransportError>>>,
    restored: Mutex<VecDeque<Result<Arc<MockHandle>, TransportError>>>,
    uris: Mutex<Vec<String>>,
    states: Mutex<Vec<SessionState>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_create(&self, result: Result<Arc<MockHandle>, TransportError>) {
        self.created.lock().push_back(result);
    }

    pub fn push_restore(&self, result: Result<Arc<MockHandle>, TransportError>) {
        self.restored.lock().push_back(result);
    }

    pub fn created_uris(&self) -> Vec<String> {
        self.uris.lock().clone()
    }

    pub fn restored_states(&self) -> Vec<SessionState> {
        self.states.lock().clone()
    }
}

#[async_trait]
impl SessionTransport for MockTransport {
    async fn create(&self, uri: &str) -> Result<Arc<dyn SessionHandle>, TransportError> {
        self.uris.lock().push(uri.to_owned());
        let next = self.created.lock().pop_front();
        match next {
            Some(Ok(handle)) => Ok(handle),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::PeerUnavailable),
        }
    }

    async fn restore(&self, state: &SessionState) -> Result<Arc<dyn SessionHandle>, TransportError> {
        self.states.lock().push(state.clone());
        let next = self.restored.lock().pop_front();
        match next {
            Some(Ok(handle)) => Ok(handle),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::PeerUnavailable),
        }
    }
}

type ResolveFn = dyn Fn(&CallRequest) -> Result<Value, ResolverError> + Send + Sync;

/// Closure-driven resolver. Optionally waits on a gate before answering so
/// tests can observe the queue mid-resolution.
pub struct MockResolver {
    respond: Box<ResolveFn>,
    gate: Option<Arc<Notify>>,
    calls: Arc<Mutex<Vec<CallRequest>>>,
}

impl MockResolver {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&CallRequest) -> Result<Value, ResolverError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            gate: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn returning(value: Value) -> Self {
        Self::new(move |_| Ok(value.clone()))
    }

    pub fn failing(err: ResolverError) -> Self {
        Self::new(move |_| Err(err.clone()))
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Shared log of every request the resolver was asked to resolve.
    pub fn call_log(&self) -> Arc<Mutex<Vec<CallRequest>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl RequestResolver for MockResolver {
    async fn resolve(&self, request: &CallRequest) -> Result<Value, ResolverError> {
        self.calls.lock().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        (self.respond)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn negotiation_scripts() {
        let handle = MockHandle::new();
        assert!(!handle.connected());
        handle.fail_negotiation(TransportError::Negotiation("peer refused".into()));
        assert!(handle.create_session().await.is_err());
        assert!(handle.create_session().await.is_ok());
        assert!(handle.connected());
        assert_eq!(handle.negotiations(), 2);
    }

    #[tokio::test]
    async fn transport_pops_in_order() {
        let transport = MockTransport::new();
        transport.push_create(Err(TransportError::InvalidUri("x".into())));
        transport.push_create(Ok(MockHandle::new()));

        assert!(transport.create("wc:a").await.is_err());
        assert!(transport.create("wc:b").await.is_ok());
        assert_eq!(
            transport.create("wc:c").await.err(),
            Some(TransportError::PeerUnavailable)
        );
        assert_eq!(transport.created_uris(), vec!["wc:a", "wc:b", "wc:c"]);
    }

    #[test]
    fn emit_reaches_every_listener() {
        let handle = MockHandle::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            handle.on(
                TransportEventName::Connect,
                Arc::new(move |_, _| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        handle.emit(TransportEventName::Connect, None, Value::Null);
        handle.emit(TransportEventName::Disconnect, None, Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
