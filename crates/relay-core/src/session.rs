use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;

/// Capability set the wallet declares when approving a pairing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCapabilities {
    pub chain_id: u64,
    pub accounts: Vec<String>,
}

impl SessionCapabilities {
    pub fn new(chain_id: u64, accounts: Vec<String>) -> Self {
        Self { chain_id, accounts }
    }
}

/// Transport-defined session blob, persisted between runs and handed back
/// to `SessionTransport::restore` untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionState(pub Value);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// Read-only view of the controller's session, as published to observers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub accounts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_uri: Option<String>,
}

/// Pull `{ accounts, chainId }` out of a lifecycle event payload.
///
/// Peers send either the bare object or the JSON-RPC style
/// `{ params: [ { accounts, chainId, .. } ] }` envelope.
pub fn capabilities_from_payload(payload: &Value) -> Option<SessionCapabilities> {
    let body = payload
        .get("params")
        .and_then(|p| p.get(0))
        .unwrap_or(payload);

    let accounts = body.get("accounts")?.as_array()?;
    let accounts = accounts
        .iter()
        .filter_map(|a| a.as_str().map(str::to_owned))
        .collect();
    let chain_id = match body.get("chainId")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => parse_chain_id(s)?,
        _ => return None,
    };
    Some(SessionCapabilities { chain_id, accounts })
}

fn parse_chain_id(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capabilities_serialize_camel_case() {
        let caps = SessionCapabilities::new(3, vec!["0xabc".into()]);
        assert_eq!(
            serde_json::to_value(&caps).unwrap(),
            json!({"chainId": 3, "accounts": ["0xabc"]})
        );
    }

    #[test]
    fn snapshot_omits_absent_fields() {
        let snap = SessionSnapshot::default();
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v, json!({"status": "disconnected", "accounts": []}));
    }

    #[test]
    fn capabilities_from_envelope() {
        let payload = json!({"event": "connect", "params": [{"accounts": ["0x1", "0x2"], "chainId": 3, "peerId": "p"}]});
        let caps = capabilities_from_payload(&payload).unwrap();
        assert_eq!(caps.chain_id, 3);
        assert_eq!(caps.accounts, vec!["0x1", "0x2"]);
    }

    #[test]
    fn capabilities_from_bare_object_and_hex_chain() {
        let caps = capabilities_from_payload(&json!({"accounts": [], "chainId": "0x2a"})).unwrap();
        assert_eq!(caps.chain_id, 42);
        assert!(caps.accounts.is_empty());
    }

    #[test]
    fn capabilities_missing_fields() {
        assert!(capabilities_from_payload(&json!({"params": [{"message": "bye"}]})).is_none());
        assert!(capabilities_from_payload(&json!(null)).is_none());
        assert!(capabilities_from_payload(&json!({"accounts": [], "chainId": true})).is_none());
    }

    #[test]
    fn status_is_connected() {
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(!ConnectionStatus::default().is_connected());
    }
}
