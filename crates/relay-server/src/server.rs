use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use relay_core::ids::ClientId;
use relay_engine::SessionLifecycleController;
use relay_telemetry::TelemetryGuard;

use crate::client::{self, ClientRegistry};
use crate::event_bridge;
use crate::handlers::{self, HandlerState};
use crate::peer::{self, HostedTransport};
use crate::rpc::{RpcRequest, RpcResponse};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9091,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub transport: Arc<HostedTransport>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/bridge/{topic}", get(peer_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. The returned handle keeps the background tasks alive.
pub async fn start(
    config: ServerConfig,
    controller: Arc<SessionLifecycleController>,
    transport: Arc<HostedTransport>,
    telemetry: Option<Arc<TelemetryGuard>>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    let bridge = event_bridge::create_bridge(Arc::clone(&client_registry), controller.subscribe());
    let cleanup = client::start_cleanup_task(Arc::clone(&client_registry), Duration::from_secs(60));

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let mut handler_state = HandlerState::new(controller);
    if let Some(telemetry) = telemetry {
        handler_state = handler_state.with_telemetry(telemetry);
    }
    let handler_state = Arc::new(handler_state);

    let rpc = tokio::spawn(process_rpc_messages(
        msg_rx,
        Arc::clone(&handler_state),
        Arc::clone(&client_registry),
    ));

    let router = build_router(AppState {
        handler_state,
        client_registry,
        transport,
        message_tx: msg_tx,
    });
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "relay server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        tasks: vec![server, bridge, rpc, cleanup],
    })
}

pub struct ServerHandle {
    pub port: u16,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "operator connected");

    client::handle_ws_connection(socket, client_id, rx, state.client_registry, state.message_tx)
        .await;
}

async fn peer_handler(
    ws: WebSocketUpgrade,
    Path(topic): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| peer::handle_peer_socket(socket, topic, state.transport))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = handlers::dispatch(&state.handler_state, "health", &json!({}), None).await;
    axum::Json(resp.result.unwrap_or_default())
}

/// Each request runs on its own task so a pending `wallet.connect` does not
/// hold up the others; responses carry the request id.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(_) => {
                if let Ok(json) = serde_json::to_string(&RpcResponse::parse_error()) {
                    registry.send_to(&client_id, json);
                }
                continue;
            }
        };

        let state = Arc::clone(&state);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let params = request.params.unwrap_or_else(|| json!({}));
            tracing::debug!(client_id = %client_id, method = %request.method, "rpc request");
            let response = handlers::dispatch(&state, &request.method, &params, request.id).await;
            if let Ok(json) = serde_json::to_string(&response) {
                registry.send_to(&client_id, json);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::request::DuplicatePolicy;
    use relay_core::session::SessionCapabilities;
    use relay_engine::mock::MockResolver;
    use relay_store::MemoryStore;

    fn controller(transport: Arc<HostedTransport>) -> Arc<SessionLifecycleController> {
        SessionLifecycleController::new(
            transport,
            Arc::new(MockResolver::returning(json!(null))),
            Arc::new(MemoryStore::new()),
            SessionCapabilities::new(3, Vec::new()),
            DuplicatePolicy::Append,
        )
    }

    #[tokio::test]
    async fn serves_health() {
        let transport = Arc::new(HostedTransport::new(Duration::from_secs(1), 8));
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, controller(Arc::clone(&transport)), transport, None)
            .await
            .unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connected"], false);

        handle.shutdown();
    }

    #[test]
    fn build_router_creates_routes() {
        let transport = Arc::new(HostedTransport::new(Duration::from_secs(1), 8));
        let (message_tx, _) = mpsc::channel(8);
        let _router = build_router(AppState {
            handler_state: Arc::new(HandlerState::new(controller(Arc::clone(&transport)))),
            client_registry: Arc::new(ClientRegistry::new(8)),
            transport,
            message_tx,
        });
    }
}
