//! End-to-end: operator socket on `/ws`, dapp peer on `/bridge/{topic}`.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay_core::request::DuplicatePolicy;
use relay_core::session::SessionCapabilities;
use relay_engine::mock::MockResolver;
use relay_engine::SessionLifecycleController;
use relay_server::{start, HostedTransport, ServerConfig, ServerHandle};
use relay_store::MemoryStore;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn boot() -> ServerHandle {
    let transport = Arc::new(HostedTransport::new(Duration::from_secs(5), 64));
    let controller = SessionLifecycleController::new(
        transport.clone(),
        Arc::new(MockResolver::returning(json!("0xsigned"))),
        Arc::new(MemoryStore::new()),
        SessionCapabilities::new(3, vec!["0xwallet".into()]),
        DuplicatePolicy::Append,
    );
    let config = ServerConfig {
        port: 0,
        ..Default::default()
    };
    start(config, controller, transport, None).await.unwrap()
}

async fn open(port: u16, path: &str) -> Socket {
    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}{path}"))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Socket, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Read frames until one satisfies `pred`.
async fn recv_until(ws: &mut Socket, pred: impl Fn(&Value) -> bool) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            let msg = ws.next().await.expect("socket closed").unwrap();
            if let Message::Text(text) = msg {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if pred(&frame) {
                    return frame;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn rpc(ws: &mut Socket, id: u64, method: &str, params: Value) -> Value {
    send(ws, json!({"id": id, "method": method, "params": params})).await;
    recv_until(ws, |f| f["id"] == json!(id)).await
}

#[tokio::test]
async fn pairing_request_and_disconnect_flow() {
    let server = boot().await;
    let mut operator = open(server.port, "/ws").await;

    // Start pairing; the reply arrives once the peer's session is approved.
    send(
        &mut operator,
        json!({"id": 1, "method": "wallet.connect", "params": {"uri": "wc:topic-1@1?bridge=local&key=00"}}),
    )
    .await;

    let mut peer = open(server.port, "/bridge/topic-1").await;
    send(
        &mut peer,
        json!({"event": "session_request", "payload": {"params": [{"peerId": "dapp", "peerMeta": {"name": "Example"}}]}}),
    )
    .await;

    let approval = recv_until(&mut peer, |f| f["method"] == "approveSession").await;
    assert_eq!(approval["params"], json!({"chainId": 3, "accounts": ["0xwallet"]}));

    let connected = recv_until(&mut operator, |f| f["id"] == 1).await;
    assert_eq!(connected["success"], true, "{connected}");
    assert_eq!(connected["result"]["status"], "connected");
    assert_eq!(connected["result"]["accounts"], json!(["0xwallet"]));

    // A call request shows up in the operator's queue.
    send(
        &mut peer,
        json!({"event": "call_request", "payload": {"id": 42, "method": "stark_sign", "params": ["0xabc"]}}),
    )
    .await;
    let update = recv_until(&mut operator, |f| {
        f["type"] == "queue_updated" && f["data"]["requests"].as_array().is_some_and(|r| r.len() == 1)
    })
    .await;
    assert_eq!(update["data"]["requests"][0]["id"], 42);

    let approved = rpc(&mut operator, 2, "requests.approve", json!({"position": 0, "id": 42})).await;
    assert_eq!(approved["result"]["decision"], "approved");

    let response = recv_until(&mut peer, |f| f["method"] == "approveRequest").await;
    assert_eq!(response["params"], json!({"id": 42, "result": "0xsigned"}));

    // Second request is declined.
    send(
        &mut peer,
        json!({"event": "call_request", "payload": {"id": 43, "method": "stark_sign", "params": []}}),
    )
    .await;
    recv_until(&mut operator, |f| {
        f["type"] == "queue_updated" && f["data"]["requests"].as_array().is_some_and(|r| r.len() == 1)
    })
    .await;
    let rejected = rpc(&mut operator, 3, "requests.reject", json!({"position": 0})).await;
    assert_eq!(rejected["result"]["rejected"]["id"], 43);
    let response = recv_until(&mut peer, |f| f["method"] == "rejectRequest").await;
    assert_eq!(response["params"]["error"]["message"], "cancelled");

    // Disconnect tears down and tells the peer.
    let state = rpc(&mut operator, 4, "wallet.disconnect", json!({})).await;
    assert_eq!(state["result"]["status"], "disconnected");
    recv_until(&mut peer, |f| f["method"] == "killSession").await;

    let list = rpc(&mut operator, 5, "requests.list", json!({})).await;
    assert_eq!(list["result"]["requests"], json!([]));

    server.shutdown();
}

#[tokio::test]
async fn peer_disconnect_clears_pending_requests() {
    let server = boot().await;
    let mut operator = open(server.port, "/ws").await;

    send(&mut operator, json!({"id": 1, "method": "wallet.connect", "params": {"uri": "wc:topic-2@1"}})).await;
    let mut peer = open(server.port, "/bridge/topic-2").await;
    send(&mut peer, json!({"event": "session_request", "payload": {}})).await;
    recv_until(&mut operator, |f| f["id"] == 1).await;

    send(&mut peer, json!({"event": "call_request", "payload": {"id": 1, "method": "m", "params": []}})).await;
    recv_until(&mut operator, |f| {
        f["type"] == "queue_updated" && f["data"]["requests"].as_array().is_some_and(|r| !r.is_empty())
    })
    .await;

    send(&mut peer, json!({"event": "disconnect", "payload": {"message": "bye"}})).await;
    recv_until(&mut operator, |f| {
        f["type"] == "session_changed" && f["data"]["snapshot"]["status"] == "disconnected"
    })
    .await;

    let list = rpc(&mut operator, 2, "requests.list", json!({})).await;
    assert_eq!(list["result"]["requests"], json!([]));
    let ping = rpc(&mut operator, 3, "system.ping", json!({})).await;
    assert_eq!(ping["result"]["connected"], false);

    server.shutdown();
}

#[tokio::test]
async fn disconnect_during_pairing_answers_pending_connect() {
    let server = boot().await;
    let mut operator = open(server.port, "/ws").await;

    send(&mut operator, json!({"id": 1, "method": "wallet.connect", "params": {"uri": "wc:idle@1"}})).await;
    // Let the connect reach negotiation before cancelling it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = rpc(&mut operator, 2, "wallet.disconnect", json!({})).await;
    assert_eq!(state["result"]["status"], "disconnected");

    let pending = recv_until(&mut operator, |f| f["id"] == 1).await;
    assert_eq!(pending["success"], false);
    assert_eq!(pending["error"]["code"], "SUPERSEDED");

    server.shutdown();
}

#[tokio::test]
async fn malformed_operator_frames() {
    let server = boot().await;
    let mut operator = open(server.port, "/ws").await;

    operator.send(Message::Text(String::from("{not json").into())).await.unwrap();
    let resp = recv_until(&mut operator, |f| f.get("success").is_some()).await;
    assert_eq!(resp["error"]["code"], "PARSE_ERROR");

    let resp = rpc(&mut operator, 9, "requests.approve", json!({"position": 0})).await;
    assert_eq!(resp["error"]["code"], "NOT_CONNECTED");

    let resp = rpc(&mut operator, 10, "wallet.connect", json!({"uri": "https://example.com"})).await;
    assert_eq!(resp["error"]["code"], "LIFECYCLE");

    server.shutdown();
}
