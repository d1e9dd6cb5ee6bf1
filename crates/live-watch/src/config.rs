use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use live_channel::monitor::DEFAULT_POLL_INTERVAL;
use live_channel::{ConnectionConfig, FetchConfig, SessionConfig};
use serde::{Deserialize, Serialize};

use crate::error::{WatchError, WatchResult};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    /// File holding the access token. Relative paths resolve against the
    /// config file's directory.
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    /// Snapshot path under `fetch.base_url`; may also be given in
    /// `fetch.routes`.
    pub route: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl TopicConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_enabled() -> bool {
    true
}

impl ClientConfig {
    /// Fetch settings with every topic's `route` folded into `routes`.
    pub fn fetch_config(&self) -> FetchConfig {
        let mut fetch = self.fetch.clone();
        for topic in &self.topics {
            if let Some(route) = &topic.route {
                fetch.routes.insert(topic.name.clone(), route.clone());
            }
        }
        fetch
    }

    /// Checks that need CLI overrides applied first.
    pub fn validate(&self) -> WatchResult<()> {
        if self.connection.url.is_empty() {
            return Err(WatchError::Config(
                "connection.url is required (or pass --url)".into(),
            ));
        }
        if self.connection.max_delay_ms < self.connection.base_delay_ms {
            return Err(WatchError::Config(format!(
                "connection.max_delay_ms ({}) is below base_delay_ms ({})",
                self.connection.max_delay_ms, self.connection.base_delay_ms
            )));
        }
        if self.connection.max_reconnect_attempts == 0 {
            return Err(WatchError::Config(
                "connection.max_reconnect_attempts must be at least 1".into(),
            ));
        }
        let mut seen = HashSet::new();
        for topic in &self.topics {
            if topic.name.is_empty() {
                return Err(WatchError::Config("topic with empty name".into()));
            }
            if !seen.insert(topic.name.as_str()) {
                return Err(WatchError::Config(format!("duplicate topic: {}", topic.name)));
            }
        }
        Ok(())
    }

    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if let Some(path) = &self.token_file
            && path.is_relative()
        {
            self.token_file = Some(config_dir.join(path));
        }
    }
}

/// Load a client config from a YAML file.
pub async fn load(path: &Path) -> WatchResult<ClientConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| WatchError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: ClientConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| WatchError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    Ok(config)
}
