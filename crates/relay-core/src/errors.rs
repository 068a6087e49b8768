use std::time::Duration;

/// Failures reported by a session transport.
///
/// Raised either from an awaited transport call (`create`, `create_session`,
/// outbound responses) or carried as the `error` half of a raw
/// `(error, payload)` event callback.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid pairing uri: {0}")]
    InvalidUri(String),
    #[error("session negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer unavailable")]
    PeerUnavailable,
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("transport closed")]
    Closed,
    #[error("{message}")]
    Remote { message: String },
}

impl TransportError {
    /// Error reported by the remote side, as-is.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidUri(_) => "invalid_uri",
            Self::Negotiation(_) => "negotiation",
            Self::PeerUnavailable => "peer_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
            Self::Remote { .. } => "remote",
        }
    }
}

/// Failures raised by a request resolver.
///
/// The `Display` text is what the peer sees in the rejection response, so
/// variants render as bare messages.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolverError {
    #[error("{0}")]
    Failed(String),
    #[error("unsupported method: {method}")]
    Unsupported { method: String },
    #[error("{0}")]
    Upstream(String),
    #[error("invalid resolver response: {0}")]
    InvalidResponse(String),
}

impl ResolverError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
