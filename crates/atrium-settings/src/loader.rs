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
use crate::types::{default_home, AtriumSettings, StoreBackend};

/// Resolve the settings file: `$ATRIUM_SETTINGS`, else `~/.atrium/settings.json`.
pub fn settings_path() -> PathBuf {
    std::env::var("ATRIUM_SETTINGS")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| default_home().join(".atrium").join("settings.json"))
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<AtriumSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<AtriumSettings> {
    let defaults = serde_json::to_value(AtriumSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::read(path, e))?;
        let user: Value = serde_json::from_str(&content).map_err(|e| SettingsError::parse(path, e))?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: AtriumSettings = serde_json::from_value(merged)?;
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

/// Apply `ATRIUM_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut AtriumSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Invalid values are ignored with a warning.
pub fn apply_overrides_from(settings: &mut AtriumSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("ATRIUM_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("ATRIUM_PORT").and_then(|v| parsed("ATRIUM_PORT", &v, parse_u16_range(&v, 1, 65535))) {
        settings.server.port = v;
    }
    if let Some(v) = read("ATRIUM_INSTANCE_ID") {
        settings.server.instance_id = Some(v);
    }
    if let Some(v) = read("ATRIUM_STORE_BACKEND") {
        let backend = match v.to_lowercase().as_str() {
            "memory" => Some(StoreBackend::Memory),
            "sqlite" => Some(StoreBackend::Sqlite),
            _ => None,
        };
        if let Some(b) = parsed("ATRIUM_STORE_BACKEND", &v, backend) {
            settings.store.backend = b;
        }
    }
    if let Some(v) = read("ATRIUM_SQLITE_PATH") {
        settings.store.sqlite_path = v;
    }
    if let Some(v) = read("ATRIUM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("ATRIUM_LOG_JSON").and_then(|v| parsed("ATRIUM_LOG_JSON", &v, parse_bool(&v))) {
        settings.logging.json = v;
    }
    if let Some(v) = read("ATRIUM_MAX_TURNS").and_then(|v| parsed("ATRIUM_MAX_TURNS", &v, parse_u64_range(&v, 1, 1000))) {
        settings.brain.max_turns = u32::try_from(v).unwrap_or(settings.brain.max_turns);
    }
    if let Some(v) = read("ATRIUM_TOKEN_BUDGET")
        .and_then(|v| parsed("ATRIUM_TOKEN_BUDGET", &v, parse_u64_range(&v, 1_000, 10_000_000)))
    {
        settings.brain.token_budget = v;
    }
    if let Some(v) = read("ATRIUM_COMPLETION_URL") {
        settings.collaborators.completion_url = Some(v);
    }
    if let Some(v) = read("ATRIUM_LAUNCHER_URL") {
        settings.collaborators.launcher_url = Some(v);
    }
}

fn parsed<T>(key: &str, raw: &str, value: Option<T>) -> Option<T> {
    if value.is_none() {
        tracing::warn!(key, value = %raw, "invalid env var, ignoring");
    }
    value
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null});
        assert_eq!(deep_merge(target, source)["a"], 1);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/atrium.json")).unwrap();
        assert_eq!(settings.brain.max_turns, AtriumSettings::default().brain.max_turns);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"brain": {"maxTurns": 7}, "workflow": {"resumeKeywords": ["go on"]}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.brain.max_turns, 7);
        assert_eq!(settings.workflow.resume_keywords, vec!["go on".to_string()]);
        assert_eq!(settings.workflow.stream_clear_timeout_secs, 60);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(load_settings_from_path(&path).unwrap_err(), SettingsError::Parse { .. }));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"brain": {"maxTurns": 0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path).unwrap_err(),
            SettingsError::Invalid { field: "brain.maxTurns", .. }
        ));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply_valid_values() {
        let mut s = AtriumSettings::default();
        apply_overrides_from(
            &mut s,
            lookup(&[
                ("ATRIUM_PORT", "8088"),
                ("ATRIUM_STORE_BACKEND", "SQLite"),
                ("ATRIUM_INSTANCE_ID", "node-a"),
                ("ATRIUM_MAX_TURNS", "5"),
                ("ATRIUM_LOG_JSON", "off"),
            ]),
        );
        assert_eq!(s.server.port, 8088);
        assert_eq!(s.store.backend, StoreBackend::Sqlite);
        assert_eq!(s.server.instance_id.as_deref(), Some("node-a"));
        assert_eq!(s.brain.max_turns, 5);
        assert!(!s.logging.json);
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut s = AtriumSettings::default();
        apply_overrides_from(
            &mut s,
            lookup(&[("ATRIUM_PORT", "0"), ("ATRIUM_STORE_BACKEND", "redis"), ("ATRIUM_MAX_TURNS", "x")]),
        );
        assert_eq!(s.server.port, 9191);
        assert_eq!(s.store.backend, StoreBackend::Memory);
        assert_eq!(s.brain.max_turns, 20);
    }

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "YES", "on"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "no", "OFF"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("65535", 1, 65535), Some(65535));
        assert_eq!(parse_u16_range("99999", 1, 65535), None);
        assert_eq!(parse_u64_range("500", 1000, 2000), None);
    }
}
