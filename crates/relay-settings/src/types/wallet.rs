use relay_core::request::DuplicatePolicy;
use relay_core::session::SessionCapabilities;
use serde::{Deserialize, Serialize};

/// Capabilities the wallet declares when auto-approving a pairing, and how
/// it treats repeated request ids.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletSettings {
    pub chain_id: u64,
    pub accounts: Vec<String>,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            chain_id: 3,
            accounts: Vec::new(),
            duplicate_policy: DuplicatePolicy::Append,
        }
    }
}

impl WalletSettings {
    pub fn capabilities(&self) -> SessionCapabilities {
        SessionCapabilities::new(self.chain_id, self.accounts.clone())
    }
}
