use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-client outbound queue depth; a full queue drops messages.
    pub max_send_queue: usize,
    /// How long a hosted session waits for the peer to approve.
    pub negotiation_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9091,
            max_send_queue: 256,
            negotiation_timeout_ms: 30_000,
        }
    }
}

/// Upstream JSON-RPC node used by the forwarding resolver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolverSettings {
    pub rpc_url: String,
    pub timeout_ms: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            rpc_url: "https://ropsten.rpc.authereum.com".to_string(),
            timeout_ms: 30_000,
        }
    }
}
