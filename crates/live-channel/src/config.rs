//! Tunables for the manager, the session guard and the HTTP fetcher.
//!
//! Every field has a serde default so a config file only needs to name what it
//! changes. Durations are plain milliseconds on the wire.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_BASE_DELAY_MS: u64 = 5_000;
pub(crate) const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
pub(crate) const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub(crate) const DEFAULT_MIN_CONNECT_INTERVAL_MS: u64 = 2_000;
pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 20_000;
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 25_000;
pub(crate) const DEFAULT_LOGOUT_REDIRECT_DELAY_MS: u64 = 3_000;
pub(crate) const DEFAULT_TOKEN_REFRESH_REASON: &str = "token_refresh";
pub(crate) const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket endpoint, e.g. `wss://admin.example.com/realtime`.
    pub url: String,
    /// First reconnect delay.
    pub base_delay_ms: u64,
    /// Cap on the reconnect delay.
    pub max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Minimum time between two caller-triggered connect attempts.
    pub min_connect_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Ping cadence; `None` disables keepalive and idle detection.
    pub keepalive_interval_ms: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            min_connect_interval_ms: DEFAULT_MIN_CONNECT_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            keepalive_interval_ms: Some(DEFAULT_KEEPALIVE_INTERVAL_MS),
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn min_connect_interval(&self) -> Duration {
        Duration::from_millis(self.min_connect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between the termination notice and the login redirect.
    pub logout_redirect_delay_ms: u64,
    /// Termination reason that means "reconnect with the refreshed token".
    pub token_refresh_reason: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            logout_redirect_delay_ms: DEFAULT_LOGOUT_REDIRECT_DELAY_MS,
            token_refresh_reason: DEFAULT_TOKEN_REFRESH_REASON.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn logout_redirect_delay(&self) -> Duration {
        Duration::from_millis(self.logout_redirect_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Base URL of the snapshot API, e.g. `https://admin.example.com`.
    pub base_url: String,
    /// Topic name to path, e.g. `properties: /api/properties/summary`.
    pub routes: HashMap<String, String>,
    pub timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            routes: HashMap::new(),
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
