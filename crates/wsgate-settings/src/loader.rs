//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If a settings file is given, deep-merge its values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::GatewaySettings;

/// Load settings, optionally from a file, with env var overrides.
pub fn load_settings(path: Option<&Path>) -> Result<GatewaySettings> {
    match path {
        Some(path) => load_settings_from_path(path),
        None => {
            let mut settings = GatewaySettings::default();
            apply_env_overrides(&mut settings);
            settings.validate()?;
            Ok(settings)
        }
    }
}

/// Load settings from a specific path with env var overrides.
///
/// A path that does not exist is an error: the operator asked for it
/// explicitly. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    let defaults = serde_json::to_value(GatewaySettings::default())?;

    debug!(?path, "loading settings from file");
    let content = std::fs::read_to_string(path)?;
    let user: Value = serde_json::from_str(&content)?;
    if !user.is_object() {
        return Err(SettingsError::InvalidValue(
            "settings file must contain a JSON object".into(),
        ));
    }
    let merged = deep_merge(defaults, user);

    let mut settings: GatewaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `WSGATE_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut GatewaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// Each variable has strict parsing rules; invalid values are ignored with
/// a warning and the file/default value is kept.
pub fn apply_overrides_from<F>(settings: &mut GatewaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let parsed = |name: &str, kind: &str, parse: &dyn Fn(&str) -> Option<u64>| {
        let val = lookup(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("WSGATE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = parsed("WSGATE_PORT", "port", &|s: &str| {
        parse_u64_range(s, 0, u64::from(u16::MAX))
    }) {
        #[allow(clippy::cast_possible_truncation)]
        let port = v as u16;
        settings.server.port = port;
    }
    if let Some(v) = string("WSGATE_PATH") {
        settings.server.path = v;
    }
    if let Some(v) = parsed("WSGATE_MAX_CONNECTIONS", "count", &|s: &str| {
        parse_u64_range(s, 1, 10_000_000)
    }) {
        settings.server.max_connections = usize::try_from(v).unwrap_or(usize::MAX);
    }

    // ── Keep-alive ──────────────────────────────────────────────────
    if let Some(v) = parsed("WSGATE_PING_INTERVAL_MS", "millis", &|s: &str| {
        parse_u64_range(s, 100, 3_600_000)
    }) {
        settings.keep_alive.ping_interval_ms = v;
    }
    if let Some(v) = parsed("WSGATE_MAX_SIMULTANEOUS_PINGS", "count", &|s: &str| {
        parse_u64_range(s, 1, 1_000_000)
    }) {
        settings.keep_alive.max_simultaneous_pings = usize::try_from(v).unwrap_or(usize::MAX);
    }

    // ── Dispatch ────────────────────────────────────────────────────
    if let Some(v) = parsed("WSGATE_REQUEST_TIMEOUT_MS", "millis", &|s: &str| {
        parse_u64_range(s, 0, 3_600_000)
    }) {
        settings.dispatch.request_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("WSGATE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(raw) = lookup("WSGATE_LOG_JSON") {
        match parse_bool(&raw) {
            Some(v) => settings.logging.json = v,
            None => warn!(key = "WSGATE_LOG_JSON", value = %raw, "invalid boolean env var, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
