//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{Environment, ProntoSettings};

/// Resolve the settings file: `$PRONTO_SETTINGS`, else `~/.pronto/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string("PRONTO_SETTINGS") {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".pronto").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ProntoSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ProntoSettings> {
    let defaults = serde_json::to_value(ProntoSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ProntoSettings = serde_json::from_value(merged)?;
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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut ProntoSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("PRONTO_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("PRONTO_PORT", 1, 65535) {
        settings.server.port = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = read_env_string("PRONTO_ENV") {
        match Environment::parse(&v) {
            Some(env) => settings.auth.environment = env,
            None => tracing::warn!(key = "PRONTO_ENV", value = %v, "unknown environment, ignoring"),
        }
    }
    if let Some(v) = read_env_bool("WS_REQUIRE_AUTH") {
        settings.auth.require_auth = v;
    }
    if let Some(v) = read_env_string("WS_ALLOWED_ORIGINS") {
        settings.auth.allowed_origins = parse_origin_list(&v);
    }
    if let Some(v) = read_env_bool("WS_ALLOW_NO_ORIGIN") {
        settings.auth.allow_missing_origin = v;
    }
    if let Some(v) = read_env_u64("WS_TICKET_TTL_SECS", 1, 3_600) {
        settings.auth.ticket_ttl_secs = v;
    }
    if let Some(v) = read_env_string("REDIS_URL") {
        settings.auth.redis_url = Some(v);
    }

    // ── WebSocket ───────────────────────────────────────────────────
    if let Some(v) = read_env_u64("WS_HEARTBEAT_INTERVAL_MS", 1_000, 600_000) {
        settings.websocket.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_u64("WS_PENDING_TTL_SECS", 1, 3_600) {
        settings.websocket.pending_ttl_secs = v;
    }

    // ── Enrichment ──────────────────────────────────────────────────
    if let Some(v) = read_env_string("PROVIDER_RESOLVER_URL") {
        settings.enrichment.resolver_url = Some(v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a comma separated origin list, dropping blanks and trailing slashes.
pub fn parse_origin_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
