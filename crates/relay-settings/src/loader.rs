//! Settings loading: defaults, then the JSON file deep-merged on top, then
//! `RELAY_*` environment overrides.
//!
//! Deep merge rules:
//! - objects merge recursively, source wins per key
//! - arrays and primitives are replaced by the source
//! - nulls in the source are skipped

use std::path::{Path, PathBuf};

use relay_core::request::DuplicatePolicy;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{relay_dir, RelaySettings};

pub fn settings_path() -> PathBuf {
    relay_dir().join("settings.json")
}

pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` (missing file means defaults) and apply env overrides.
/// Malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Values that fail to parse or fall
/// outside their range are ignored with a warning.
pub fn apply_overrides<F>(settings: &mut RelaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("RELAY_PORT", |s| parse_range::<u16>(s, 1, u16::MAX)) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed("RELAY_NEGOTIATION_TIMEOUT_MS", |s| {
        parse_range::<u64>(s, 100, 600_000)
    }) {
        settings.server.negotiation_timeout_ms = v;
    }
    if let Some(v) = env.parsed("RELAY_CHAIN_ID", |s| parse_range::<u64>(s, 1, u64::MAX)) {
        settings.wallet.chain_id = v;
    }
    if let Some(v) = env.string("RELAY_ACCOUNTS") {
        settings.wallet.accounts = parse_list(&v);
    }
    if let Some(v) = env.parsed("RELAY_DUPLICATE_POLICY", parse_duplicate_policy) {
        settings.wallet.duplicate_policy = v;
    }
    if let Some(v) = env.string("RELAY_RPC_URL") {
        settings.resolver.rpc_url = v;
    }
    if let Some(v) = env.string("RELAY_STORE_PATH") {
        settings.store.path = v;
    }
    if let Some(v) = env.parsed("RELAY_LOG_LEVEL", parse_log_level) {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = env.parsed("RELAY_LOG_TO_SQLITE", parse_bool) {
        settings.telemetry.log_to_sqlite = v;
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let raw = self.string(name)?;
        let parsed = parse(&raw);
        if parsed.is_none() {
            warn!(key = name, value = %raw, "invalid env override, ignoring");
        }
        parsed
    }
}

/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Comma-separated list; blank items are dropped.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

pub fn parse_log_level(val: &str) -> Option<String> {
    let level = val.to_lowercase();
    matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error").then_some(level)
}

pub fn parse_duplicate_policy(val: &str) -> Option<DuplicatePolicy> {
    serde_json::from_value(Value::String(val.to_lowercase())).ok()
}
