use relay_core::errors::TransportError;
use relay_core::request::RequestId;
use relay_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no active session")]
    NotConnected,

    #[error("no pending request at position {position} (queue length {len})")]
    OutOfRange { position: usize, len: usize },

    #[error("request {id} is no longer pending")]
    StaleSelection { id: RequestId },

    #[error("superseded by a newer connect")]
    Superseded,

    #[error("no connect uri to retry")]
    NoConnectUri,

    #[error("session lifecycle error: {0}")]
    Lifecycle(#[from] TransportError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::OutOfRange { .. } => "out_of_range",
            Self::StaleSelection { .. } => "stale_selection",
            Self::Superseded => "superseded",
            Self::NoConnectUri => "no_connect_uri",
            Self::Lifecycle(_) => "lifecycle",
            Self::Store(_) => "store",
        }
    }
}

/// Failure returned by a bridge subscriber. Logged by the bridge, never
/// propagated to the transport or to other subscribers.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}
