//! Session transport boundary.
//!
//! A transport pairs the wallet with one remote peer. It is consumed only
//! through these traits so the relay core never depends on a concrete
//! pairing protocol.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::TransportError;
use crate::events::TransportEventName;
use crate::request::{ApprovedResponse, RejectedResponse};
use crate::session::{SessionCapabilities, SessionState};

/// Callback-style event listener, invoked as `(error, payload)`.
///
/// Transports offer no way to remove a listener once registered.
pub type RawCallback = Arc<dyn Fn(Option<TransportError>, Value) + Send + Sync>;

/// Factory for session handles.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Construct a session from a pairing URI. The handle may already report
    /// itself connected when the pairing is being resumed.
    async fn create(&self, uri: &str) -> Result<Arc<dyn SessionHandle>, TransportError>;

    /// Rebuild a session from a blob previously returned by
    /// [`SessionHandle::session_state`].
    async fn restore(&self, state: &SessionState) -> Result<Arc<dyn SessionHandle>, TransportError>;
}

/// One live pairing.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn connected(&self) -> bool;
    fn accounts(&self) -> Vec<String>;
    fn chain_id(&self) -> Option<u64>;

    /// Opaque blob to persist for [`SessionTransport::restore`].
    fn session_state(&self) -> SessionState;

    /// Actively negotiate the session with the peer. Resolves once the
    /// transport reports the session established.
    async fn create_session(&self) -> Result<(), TransportError>;

    async fn approve_session(&self, capabilities: SessionCapabilities) -> Result<(), TransportError>;
    async fn kill_session(&self) -> Result<(), TransportError>;
    async fn approve_request(&self, response: ApprovedResponse) -> Result<(), TransportError>;
    async fn reject_request(&self, response: RejectedResponse) -> Result<(), TransportError>;

    /// Register a listener for `event`. Listeners accumulate.
    fn on(&self, event: TransportEventName, callback: RawCallback);
}
