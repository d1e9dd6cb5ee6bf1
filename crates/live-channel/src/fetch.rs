//! Snapshot fetching for topic monitors.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::config::FetchConfig;
use crate::credentials::CredentialStore;
use crate::error::FetchError;

/// Produces the current snapshot for a topic. Used for the initial load,
/// manual refresh and periodic polling.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, topic: &str) -> Result<Value, FetchError>;
}

/// Fetches snapshots over HTTP: `GET {base_url}{route}` with the stored token
/// as a bearer credential.
pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        tracing::debug!(
            base_url = %config.base_url,
            routes = config.routes.len(),
            "Snapshot fetcher initialized"
        );
        Ok(Self {
            client,
            config,
            credentials,
        })
    }

    fn url_for(&self, topic: &str) -> Result<String, FetchError> {
        let route = self
            .config
            .routes
            .get(topic)
            .ok_or_else(|| FetchError::UnknownTopic(topic.to_string()))?;
        Ok(format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            route
        ))
    }
}

#[async_trait]
impl SnapshotFetcher for HttpFetcher {
    async fn fetch(&self, topic: &str) -> Result<Value, FetchError> {
        let url = self.url_for(topic)?;
        let mut req = self.client.get(&url);
        if let Some(token) = self.credentials.token() {
            req = req.bearer_auth(token.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            tracing::warn!(topic, %status, "Snapshot request failed");
            return Err(FetchError::Status {
                topic: topic.to_string(),
                status: status.as_u16(),
            });
        }

        let body: Value = resp.json().await?;
        tracing::trace!(topic, "Snapshot fetched");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::credentials::{MemoryCredentialStore, Token};

    fn fetcher(server: &MockServer, token: Option<&str>) -> HttpFetcher {
        let config = FetchConfig {
            base_url: server.base_url(),
            routes: HashMap::from([
                ("properties".to_string(), "/api/properties/summary".to_string()),
                ("leases".to_string(), "/api/leases".to_string()),
            ]),
            ..Default::default()
        };
        let store = MemoryCredentialStore::new(token.map(Token::new));
        HttpFetcher::new(config, Arc::new(store)).unwrap()
    }

    #[tokio::test]
    async fn fetch_sends_bearer_token_to_topic_route() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/properties/summary")
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(json!({"count": 3}));
            })
            .await;

        let value = fetcher(&server, Some("secret")).fetch("properties").await.unwrap();
        assert_eq!(value, json!({"count": 3}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_without_token_omits_auth_header() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/leases").matches(|req| {
                    req.headers.as_ref().is_none_or(|headers| {
                        !headers
                            .iter()
                            .any(|(name, _)| name.eq_ignore_ascii_case("authorization"))
                    })
                });
                then.status(200).json_body(json!([]));
            })
            .await;

        let value = fetcher(&server, None).fetch("leases").await.unwrap();
        assert_eq!(value, json!([]));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/leases");
                then.status(503).body("maintenance");
            })
            .await;

        let err = fetcher(&server, Some("t")).fetch("leases").await.unwrap_err();
        assert!(
            matches!(err, FetchError::Status { ref topic, status: 503 } if topic == "leases"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn unknown_topic_never_hits_the_network() {
        let server = MockServer::start_async().await;
        let err = fetcher(&server, Some("t")).fetch("inventory").await.unwrap_err();
        assert!(matches!(err, FetchError::UnknownTopic(ref t) if t == "inventory"));
    }

    #[tokio::test]
    async fn invalid_json_is_an_http_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/properties/summary");
                then.status(200).body("<html>not json</html>");
            })
            .await;

        let err = fetcher(&server, Some("t")).fetch("properties").await.unwrap_err();
        assert!(matches!(err, FetchError::Http(_)));
    }
}
