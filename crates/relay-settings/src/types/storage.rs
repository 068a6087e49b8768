use serde::{Deserialize, Serialize};

use super::default_db_path;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_db_path("relay.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    pub log_level: String,
    pub log_to_sqlite: bool,
    pub log_db_path: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: default_db_path("relay-logs.db"),
        }
    }
}
