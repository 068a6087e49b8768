use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use relay_core::events::WalletEvent;

use crate::client::ClientRegistry;

/// Wire form pushed to operator sockets: `{ "type": <event>, "data": <event body> }`.
pub fn serialize_event(event: &WalletEvent) -> Option<String> {
    let mut body = serde_json::to_value(event).ok()?;
    if let Some(map) = body.as_object_mut() {
        map.remove("type");
    }
    serde_json::to_string(&json!({ "type": event.event_type(), "data": body })).ok()
}

/// Forward every wallet event to every operator socket until the channel closes.
pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    mut rx: broadcast::Receiver<WalletEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(json) = serialize_event(&event) {
                        registry.broadcast(&json);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event bridge channel closed");
                    break;
                }
            }
        }
    })
}
