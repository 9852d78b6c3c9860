use parking_lot::RwLock;
use serde_json::{json, Map, Value as JsonValue};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;

use crate::types::Role;

pub const SETTINGS_PATH_ENV: &str = "TICKETSYNC_SETTINGS";
const SETTINGS_STORE_FILE: &str = "ticketsync-settings.json";

pub const KEY_TICKETS_BASE_URL: &str = "ticketsBaseUrl";
pub const KEY_NOTIFICATIONS_BASE_URL: &str = "notificationsBaseUrl";
pub const KEY_ASSIGNMENTS_BASE_URL: &str = "assignmentsBaseUrl";
pub const KEY_USERS_BASE_URL: &str = "usersBaseUrl";
pub const KEY_REQUEST_TIMEOUT_SECONDS: &str = "requestTimeoutSeconds";
pub const KEY_CONNECT_TIMEOUT_SECONDS: &str = "connectTimeoutSeconds";
pub const KEY_STREAM_RETRY_INITIAL_MS: &str = "streamRetryInitialMs";
pub const KEY_STREAM_RETRY_MAX_MS: &str = "streamRetryMaxMs";
pub const KEY_REMEMBER_SESSION: &str = "rememberSession";
pub const KEY_PRIVILEGED_ROLE: &str = "privilegedRole";
pub const KEY_EXPIRY_SKEW_SECONDS: &str = "expirySkewSeconds";

/// Environment overrides, applied after the file is read.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("TICKETSYNC_TICKETS_URL", KEY_TICKETS_BASE_URL),
    ("TICKETSYNC_NOTIFICATIONS_URL", KEY_NOTIFICATIONS_BASE_URL),
    ("TICKETSYNC_ASSIGNMENTS_URL", KEY_ASSIGNMENTS_BASE_URL),
    ("TICKETSYNC_USERS_URL", KEY_USERS_BASE_URL),
    ("TICKETSYNC_REQUEST_TIMEOUT_SECONDS", KEY_REQUEST_TIMEOUT_SECONDS),
    ("TICKETSYNC_REMEMBER_SESSION", KEY_REMEMBER_SESSION),
    ("TICKETSYNC_PRIVILEGED_ROLE", KEY_PRIVILEGED_ROLE),
];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file")]
    Io(#[from] std::io::Error),
    #[error("invalid settings json")]
    Json(#[from] serde_json::Error),
    #[error("settings file must contain a json object")]
    NotAnObject,
}

fn defaults() -> HashMap<String, JsonValue> {
    HashMap::from([
        (KEY_TICKETS_BASE_URL.to_string(), json!("http://localhost:8001")),
        (KEY_NOTIFICATIONS_BASE_URL.to_string(), json!("http://localhost:8002")),
        (KEY_ASSIGNMENTS_BASE_URL.to_string(), json!("http://localhost:8003")),
        (KEY_USERS_BASE_URL.to_string(), json!("http://localhost:8004")),
        (KEY_REQUEST_TIMEOUT_SECONDS.to_string(), json!(30)),
        (KEY_CONNECT_TIMEOUT_SECONDS.to_string(), json!(10)),
        (KEY_STREAM_RETRY_INITIAL_MS.to_string(), json!(3000)),
        (KEY_STREAM_RETRY_MAX_MS.to_string(), json!(60_000)),
        (KEY_REMEMBER_SESSION.to_string(), json!(true)),
        (KEY_PRIVILEGED_ROLE.to_string(), json!("admin")),
        (KEY_EXPIRY_SKEW_SECONDS.to_string(), json!(0)),
    ])
}

/// Coerces an environment string into the json type of the default it overrides.
fn coerce_env_value(raw: &str, default: Option<&JsonValue>) -> JsonValue {
    let raw = raw.trim();
    match default {
        Some(JsonValue::Bool(_)) => json!(matches!(raw, "1" | "true" | "yes" | "on")),
        Some(JsonValue::Number(_)) => raw
            .parse::<u64>()
            .map(JsonValue::from)
            .unwrap_or_else(|_| json!(raw)),
        _ => json!(raw),
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    values: Arc<RwLock<Map<String, JsonValue>>>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::from_map(Map::new())
    }
}

impl SettingsStore {
    /// Defaults overlaid with `overrides`.
    pub fn from_map(overrides: Map<String, JsonValue>) -> Self {
        let mut values: Map<String, JsonValue> = defaults().into_iter().collect();
        values.extend(overrides);
        Self {
            values: Arc::new(RwLock::new(values)),
        }
    }

    /// Reads the settings file (missing file means defaults) and applies env overrides.
    pub fn load() -> Result<Self, SettingsError> {
        let path = std::env::var(SETTINGS_PATH_ENV)
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(SETTINGS_STORE_FILE));

        let store = Self::load_file(&path)?;
        store.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(store)
    }

    pub fn load_file(path: &std::path::Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "settings file not found, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        match serde_json::from_str::<JsonValue>(&data)? {
            JsonValue::Object(map) => Ok(Self::from_map(map)),
            _ => Err(SettingsError::NotAnObject),
        }
    }

    pub fn apply_env_overrides(&self, lookup: impl Fn(&str) -> Option<String>) {
        let mut values = self.values.write();
        for (env_name, key) in ENV_OVERRIDES {
            let Some(raw) = lookup(env_name) else {
                continue;
            };
            if raw.trim().is_empty() {
                continue;
            }
            let value = coerce_env_value(&raw, values.get(*key));
            values.insert((*key).to_string(), value);
        }
    }

    pub fn get_u64(&self, key: &str, fallback: u64) -> u64 {
        self.values
            .read()
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(fallback)
    }

    pub fn get_bool(&self, key: &str, fallback: bool) -> bool {
        self.values
            .read()
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(fallback)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        let values = self.values.read();
        let s = values.get(key)?.as_str()?.trim();
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    }

    pub fn set(&self, key: &str, value: impl Into<JsonValue>) {
        self.values.write().insert(key.to_string(), value.into());
    }

    /// Base URL with any trailing slash removed.
    pub fn base_url(&self, key: &str) -> String {
        self.get_string(key)
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.get_u64(KEY_REQUEST_TIMEOUT_SECONDS, 30).max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.get_u64(KEY_CONNECT_TIMEOUT_SECONDS, 10).max(1))
    }

    pub fn stream_retry_initial_ms(&self) -> u64 {
        self.get_u64(KEY_STREAM_RETRY_INITIAL_MS, 3000)
    }

    pub fn stream_retry_max_ms(&self) -> u64 {
        self.get_u64(KEY_STREAM_RETRY_MAX_MS, 60_000)
            .max(self.stream_retry_initial_ms())
    }

    pub fn remember_session(&self) -> bool {
        self.get_bool(KEY_REMEMBER_SESSION, true)
    }

    pub fn privileged_role(&self) -> Role {
        self.get_string(KEY_PRIVILEGED_ROLE)
            .map(|r| Role::parse(&r))
            .unwrap_or(Role::Admin)
    }

    pub fn expiry_skew_seconds(&self) -> i64 {
        self.get_u64(KEY_EXPIRY_SKEW_SECONDS, 0).min(i64::MAX as u64) as i64
    }

    /// Builds the process-wide HTTP client.
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let mut overrides = Map::new();
        overrides.insert(KEY_TICKETS_BASE_URL.to_string(), json!("http://tickets:9000/"));
        let store = SettingsStore::from_map(overrides);

        assert_eq!(store.base_url(KEY_TICKETS_BASE_URL), "http://tickets:9000");
        assert_eq!(store.base_url(KEY_USERS_BASE_URL), "http://localhost:8004");
        assert_eq!(store.stream_retry_initial_ms(), 3000);
        assert!(store.remember_session());
        assert_eq!(store.privileged_role(), Role::Admin);
    }

    #[test]
    fn env_overrides_keep_value_types() {
        let store = SettingsStore::default();
        store.apply_env_overrides(|name| match name {
            "TICKETSYNC_REMEMBER_SESSION" => Some("false".to_string()),
            "TICKETSYNC_REQUEST_TIMEOUT_SECONDS" => Some("5".to_string()),
            "TICKETSYNC_USERS_URL" => Some("http://users".to_string()),
            "TICKETSYNC_PRIVILEGED_ROLE" => Some("   ".to_string()),
            _ => None,
        });

        assert!(!store.remember_session());
        assert_eq!(store.request_timeout(), Duration::from_secs(5));
        assert_eq!(store.base_url(KEY_USERS_BASE_URL), "http://users");
        assert_eq!(store.privileged_role(), Role::Admin);
    }

    #[test]
    fn retry_max_never_below_initial() {
        let store = SettingsStore::default();
        store.set(KEY_STREAM_RETRY_INITIAL_MS, 5000);
        store.set(KEY_STREAM_RETRY_MAX_MS, 1000);
        assert_eq!(store.stream_retry_max_ms(), 5000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::load_file(std::path::Path::new("/nonexistent/ticketsync.json"))
            .unwrap();
        assert_eq!(store.get_u64(KEY_CONNECT_TIMEOUT_SECONDS, 0), 10);
    }
}
