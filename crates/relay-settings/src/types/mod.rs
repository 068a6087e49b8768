//! Settings type definitions.
//!
//! Every section is `camelCase` on the wire and `#[serde(default)]`, so a
//! partial JSON file only needs the keys it changes.

mod server;
mod storage;
mod wallet;

pub use server::*;
pub use storage::*;
pub use wallet::*;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub wallet: WalletSettings,
    pub server: ServerSettings,
    pub resolver: ResolverSettings,
    pub store: StoreSettings,
    pub telemetry: TelemetrySettings,
}

/// `~/.relay`, falling back to `/tmp/.relay` when `HOME` is unset.
pub fn relay_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay")
}

pub(crate) fn default_db_path(file: &str) -> String {
    relay_dir()
        .join("database")
        .join(file)
        .to_string_lossy()
        .into_owned()
}
