//! Resolver that answers account queries locally and forwards everything
//! else to an upstream JSON-RPC node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use relay_core::errors::ResolverError;
use relay_core::request::CallRequest;
use relay_core::resolver::RequestResolver;
use relay_core::session::SessionCapabilities;

pub struct RpcForwardResolver {
    client: Client,
    rpc_url: String,
    capabilities: SessionCapabilities,
    next_id: AtomicU64,
}

impl RpcForwardResolver {
    pub fn new(
        rpc_url: impl Into<String>,
        timeout: Duration,
        capabilities: SessionCapabilities,
    ) -> Result<Self, ResolverError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolverError::Upstream(e.to_string()))?;
        Ok(Self {
            client,
            rpc_url: rpc_url.into(),
            capabilities,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    fn answer_locally(&self, method: &str) -> Option<Value> {
        match method {
            "eth_accounts" | "eth_requestAccounts" => Some(json!(self.capabilities.accounts)),
            "eth_chainId" => Some(json!(format!("0x{:x}", self.capabilities.chain_id))),
            "net_version" => Some(json!(self.capabilities.chain_id.to_string())),
            _ => None,
        }
    }

    async fn forward(&self, request: &CallRequest) -> Result<Value, ResolverError> {
        let params = match &request.params {
            Value::Null => json!([]),
            other => other.clone(),
        };
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": request.method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ResolverError::Upstream(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, method = %request.method, "upstream rejected call");
            return Err(ResolverError::Upstream(format!("upstream returned {status}: {text}")));
        }

        let reply: Value = resp
            .json()
            .await
            .map_err(|e| ResolverError::InvalidResponse(e.to_string()))?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_owned);
            return Ok(json!({ "error": { "message": message } }));
        }

        reply
            .get("result")
            .cloned()
            .ok_or_else(|| ResolverError::InvalidResponse("missing result".into()))
    }
}

#[async_trait]
impl RequestResolver for RpcForwardResolver {
    #[instrument(skip(self, request), fields(request_id = %request.id, method = %request.method))]
    async fn resolve(&self, request: &CallRequest) -> Result<Value, ResolverError> {
        if let Some(value) = self.answer_locally(&request.method) {
            debug!("answered locally");
            return Ok(value);
        }
        self.forward(request).await
    }
}
