//! Error types for the live-channel crate.

use tokio_tungstenite::tungstenite;

/// Failures opening or using the shared channel. Always retried through the
/// reconnect scheduler.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("frame encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    Closed(String),

    #[error("channel open timed out")]
    Timeout,
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(e))
    }
}

/// The stored credential cannot be used. Not retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("no credential stored")]
    Missing,

    #[error("credential expired")]
    Expired,
}

/// A topic snapshot fetch failed.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("snapshot request for {topic} returned status {status}")]
    Status { topic: String, status: u16 },

    #[error("no route configured for topic {0}")]
    UnknownTopic(String),

    #[error("cannot authenticate snapshot request: {0}")]
    Credential(#[from] CredentialError),

    #[error("fetch failed: {0}")]
    Failed(String),
}

/// Umbrella error for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("session terminated by server ({reason}){}", message_suffix(.message))]
    ForcedTermination {
        reason: String,
        message: Option<String>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

fn message_suffix(message: &Option<String>) -> String {
    message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
}
