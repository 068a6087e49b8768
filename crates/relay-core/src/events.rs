use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::request::{CallRequest, Decision, RequestId};
use crate::session::SessionSnapshot;

/// Raw event names a session transport emits through `SessionHandle::on`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportEventName {
    #[serde(rename = "connect")]
    Connect,
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "session_request")]
    SessionRequest,
    #[serde(rename = "session_update")]
    SessionUpdate,
    #[serde(rename = "call_request")]
    CallRequest,
    #[serde(rename = "wc_sessionRequest")]
    WcSessionRequest,
    #[serde(rename = "wc_sessionUpdate")]
    WcSessionUpdate,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "transport_open")]
    TransportOpen,
    #[serde(rename = "transport_close")]
    TransportClose,
}

impl TransportEventName {
    pub const ALL: [Self; 10] = [
        Self::Connect,
        Self::Disconnect,
        Self::SessionRequest,
        Self::SessionUpdate,
        Self::CallRequest,
        Self::WcSessionRequest,
        Self::WcSessionUpdate,
        Self::Error,
        Self::TransportOpen,
        Self::TransportClose,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::SessionRequest => "session_request",
            Self::SessionUpdate => "session_update",
            Self::CallRequest => "call_request",
            Self::WcSessionRequest => "wc_sessionRequest",
            Self::WcSessionUpdate => "wc_sessionUpdate",
            Self::Error => "error",
            Self::TransportOpen => "transport_open",
            Self::TransportClose => "transport_close",
        }
    }
}

impl fmt::Display for TransportEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown transport event: {0}")]
pub struct UnknownEventName(pub String);

impl FromStr for TransportEventName {
    type Err = UnknownEventName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownEventName(s.to_owned()))
    }
}

/// Notifications the wallet publishes to its observers (operator sockets, UI).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WalletEvent {
    #[serde(rename = "queue_updated")]
    QueueUpdated {
        version: u64,
        requests: Vec<CallRequest>,
    },

    #[serde(rename = "session_changed")]
    SessionChanged { snapshot: SessionSnapshot },

    #[serde(rename = "request_resolved")]
    RequestResolved { id: RequestId, decision: Decision },
}

impl WalletEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::QueueUpdated { .. } => "queue_updated",
            Self::SessionChanged { .. } => "session_changed",
            Self::RequestResolved { .. } => "request_resolved",
        }
    }
}
