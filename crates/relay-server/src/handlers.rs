//! Operator RPC methods.

use std::sync::Arc;

use serde_json::{json, Value};

use relay_core::request::RequestId;
use relay_engine::{SessionLifecycleController, Target};
use relay_telemetry::{LogQuery, TelemetryGuard};

use crate::rpc::{self, RpcResponse};

pub struct HandlerState {
    pub controller: Arc<SessionLifecycleController>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl HandlerState {
    pub fn new(controller: Arc<SessionLifecycleController>) -> Self {
        Self {
            controller,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

pub async fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    match method {
        // Wallet
        "wallet.connect" => wallet_connect(state, params, id).await,
        "wallet.disconnect" => wallet_disconnect(state, id).await,
        "wallet.state" | "wallet.getState" => wallet_state(state, id),

        // Requests
        "requests.list" => requests_list(state, id),
        "requests.approve" => requests_approve(state, params, id).await,
        "requests.reject" => requests_reject(state, params, id).await,

        // System
        "system.ping" | "health" => health(state, id),

        // Telemetry
        "telemetry.logs" => telemetry_logs(state, params, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

async fn wallet_connect(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let result = match rpc::optional_str(params, "uri") {
        Some(uri) => state.controller.connect(uri).await,
        None => state.controller.reconnect().await,
    };
    match result {
        Ok(snapshot) => RpcResponse::success(id, json!(snapshot)),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn wallet_disconnect(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    let snapshot = state.controller.disconnect().await;
    RpcResponse::success(id, json!(snapshot))
}

fn wallet_state(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    let controller = &state.controller;
    RpcResponse::success(
        id,
        json!({
            "session": controller.snapshot(),
            "pending": controller.pending().requests.len(),
            "capabilities": controller.capabilities(),
        }),
    )
}

fn requests_list(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    RpcResponse::success(id, json!(state.controller.pending()))
}

/// `{ position, id? }`. With `id` the selection is pinned to that request.
fn target_from(params: &Value) -> Result<Target, String> {
    let position = usize::try_from(rpc::require_u64(params, "position")?)
        .map_err(|_| "position out of range".to_owned())?;
    Ok(match params.get("id").filter(|v| !v.is_null()) {
        Some(id) => Target::Pinned {
            position,
            id: RequestId::new(id.clone()),
        },
        None => Target::Position(position),
    })
}

async fn requests_approve(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let target = match target_from(params) {
        Ok(t) => t,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    match state.controller.approve(target).await {
        Ok(decision) => RpcResponse::success(id, json!(decision)),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn requests_reject(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let target = match target_from(params) {
        Ok(t) => t,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    match state.controller.reject(target).await {
        Ok(request) => RpcResponse::success(id, json!({ "rejected": request })),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

fn health(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        json!({
            "status": "healthy",
            "connected": state.controller.status().is_connected(),
            "pending": state.controller.pending().requests.len(),
        }),
    )
}

fn telemetry_logs(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let Some(sink) = state.telemetry.as_ref().and_then(|t| t.logs()) else {
        return RpcResponse::success(id, json!({ "logs": [], "enabled": false }));
    };

    let text = |key: &str| rpc::optional_str(params, key).map(str::to_owned);
    let query = LogQuery {
        level: text("level"),
        target: text("target"),
        session_id: text("sessionId"),
        request_id: text("requestId"),
        since: text("since"),
        limit: rpc::optional_u64(params, "limit").map(|v| v.min(u64::from(u32::MAX)) as u32),
    };

    match sink.query(&query) {
        Ok(logs) => RpcResponse::success(id, json!({ "logs": logs, "enabled": true })),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::events::TransportEventName;
    use relay_core::request::{CallRequest, DuplicatePolicy};
    use relay_core::session::SessionCapabilities;
    use relay_engine::mock::{MockHandle, MockResolver, MockTransport, Outbound};
    use relay_store::MemoryStore;

    struct Fixture {
        transport: Arc<MockTransport>,
        state: Arc<HandlerState>,
    }

    fn setup() -> Fixture {
        let transport = MockTransport::new();
        let controller = SessionLifecycleController::new(
            transport.clone(),
            Arc::new(MockResolver::returning(json!("0xsigned"))),
            Arc::new(MemoryStore::new()),
            SessionCapabilities::new(3, vec!["0xwallet".into()]),
            DuplicatePolicy::Append,
        );
        Fixture {
            transport,
            state: Arc::new(HandlerState::new(controller)),
        }
    }

    async fn call(state: &Arc<HandlerState>, method: &str, params: Value) -> RpcResponse {
        dispatch(state, method, &params, Some(json!(1))).await
    }

    async fn connected(f: &Fixture) -> Arc<MockHandle> {
        let handle = MockHandle::new();
        f.transport.push_create(Ok(handle.clone()));
        let resp = call(&f.state, "wallet.connect", json!({"uri": "wc:abc@1"})).await;
        assert!(resp.success);
        handle
    }

    #[tokio::test]
    async fn unknown_method() {
        let f = setup();
        let resp = call(&f.state, "wallet.explode", json!({})).await;
        assert_eq!(resp.error.unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn ping_reports_status() {
        let f = setup();
        let resp = call(&f.state, "system.ping", json!({})).await;
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "healthy");
        assert_eq!(result["connected"], false);
        assert_eq!(result["pending"], 0);
    }

    #[tokio::test]
    async fn connect_and_state() {
        let f = setup();
        connected(&f).await;
        let resp = call(&f.state, "wallet.state", json!({})).await;
        let result = resp.result.unwrap();
        assert_eq!(result["session"]["status"], "connected");
        assert_eq!(result["session"]["connectUri"], "wc:abc@1");
        assert_eq!(result["capabilities"]["chainId"], 3);
    }

    #[tokio::test]
    async fn reconnect_without_uri_fails() {
        let f = setup();
        let resp = call(&f.state, "wallet.connect", json!({})).await;
        assert_eq!(resp.error.unwrap().code, "NO_CONNECT_URI");
    }

    #[tokio::test]
    async fn approve_and_reject_by_position() {
        let f = setup();
        let handle = connected(&f).await;
        handle.emit_call(&CallRequest::new("a", "stark_sign", json!([])));
        handle.emit_call(&CallRequest::new("b", "stark_sign", json!([])));

        let list = call(&f.state, "requests.list", json!({})).await.result.unwrap();
        assert_eq!(list["requests"].as_array().unwrap().len(), 2);

        let resp = call(&f.state, "requests.approve", json!({"position": 0})).await;
        assert_eq!(resp.result.unwrap()["decision"], "approved");

        let resp = call(&f.state, "requests.reject", json!({"position": 0, "id": "b"})).await;
        assert_eq!(resp.result.unwrap()["rejected"]["id"], "b");

        assert_eq!(handle.outbound().len(), 2);
        assert!(matches!(handle.outbound()[1], Outbound::RejectRequest(_)));
    }

    #[tokio::test]
    async fn pinned_selection_goes_stale() {
        let f = setup();
        let handle = connected(&f).await;
        handle.emit_call(&CallRequest::new("a", "stark_sign", json!([])));

        let resp = call(&f.state, "requests.approve", json!({"position": 0, "id": "zzz"})).await;
        assert_eq!(resp.error.unwrap().code, "STALE_SELECTION");
        assert!(handle.outbound().is_empty());
    }

    #[tokio::test]
    async fn decisions_validate_params() {
        let f = setup();
        let resp = call(&f.state, "requests.approve", json!({})).await;
        assert_eq!(resp.error.unwrap().code, "INVALID_PARAMS");

        let resp = call(&f.state, "requests.reject", json!({"position": 0})).await;
        assert_eq!(resp.error.unwrap().code, "NOT_CONNECTED");
    }

    #[tokio::test]
    async fn disconnect_clears_everything() {
        let f = setup();
        let handle = connected(&f).await;
        handle.emit_call(&CallRequest::new("a", "stark_sign", json!([])));

        let resp = call(&f.state, "wallet.disconnect", json!({})).await;
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "disconnected");
        assert!(result.get("connectUri").is_none());
        assert_eq!(handle.outbound(), vec![Outbound::KillSession]);

        handle.emit(TransportEventName::CallRequest, None, json!({"id": 2, "method": "m"}));
        let list = call(&f.state, "requests.list", json!({})).await.result.unwrap();
        assert!(list["requests"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn logs_disabled_without_telemetry() {
        let f = setup();
        let resp = call(&f.state, "telemetry.logs", json!({})).await;
        assert_eq!(resp.result.unwrap()["enabled"], false);
    }
}
