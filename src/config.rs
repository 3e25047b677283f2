//! Client configuration.
//!
//! Endpoint paths default to the backend's auth surface; the refresh and
//! logout paths double as the exclusion list that keeps the pipelines from
//! refreshing recursively.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Timeout for the backend refresh call in seconds.
/// A hung refresh would block every request waiting on it, so this is
/// deliberately shorter than the general request timeout.
const REFRESH_TIMEOUT_SECS: u64 = 10;

/// Access credential lifetime assumed when the backend omits the expiration
/// cookie (15 minutes). The reactive 401/422 path corrects any mismatch.
const DEFAULT_ACCESS_TTL_SECS: i64 = 15 * 60;

const REFRESH_PATH: &str = "/api/auth/refresh";
const LOGIN_PATH: &str = "/api/auth/login";
const LOGOUT_PATH: &str = "/api/auth/logout";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub base_url: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_logout_path")]
    pub logout_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,
    #[serde(default = "default_access_ttl_secs")]
    pub default_access_ttl_secs: i64,
}

fn default_refresh_path() -> String {
    REFRESH_PATH.to_string()
}

fn default_login_path() -> String {
    LOGIN_PATH.to_string()
}

fn default_logout_path() -> String {
    LOGOUT_PATH.to_string()
}

fn default_request_timeout_secs() -> u64 {
    REQUEST_TIMEOUT_SECS
}

fn default_refresh_timeout_secs() -> u64 {
    REFRESH_TIMEOUT_SECS
}

fn default_access_ttl_secs() -> i64 {
    DEFAULT_ACCESS_TTL_SECS
}

impl Config {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: default_refresh_path(),
            login_path: default_login_path(),
            logout_path: default_logout_path(),
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: REFRESH_TIMEOUT_SECS,
            default_access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
        }
    }

    /// Loads configuration from a JSON file. Absent fields fall back to
    /// their defaults.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse config file")
    }

    /// Full URL for a path on the configured backend.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Paths that must never trigger a refresh, proactively or reactively.
    /// A 401 from the refresh endpoint itself would otherwise recurse forever.
    pub fn is_excluded(&self, path: &str) -> bool {
        path == self.refresh_path || path == self.logout_path
    }

    /// Paths that carry the refresh credential on the outgoing request.
    /// Only the refresh and logout endpoints ever see it.
    pub fn includes_refresh_credential(&self, path: &str) -> bool {
        path == self.refresh_path || path == self.logout_path
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}
