#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("config error: {0}")]
    Config(String),

    #[error("snapshot fetcher: {0}")]
    Fetch(#[from] live_channel::FetchError),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("could not connect within {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("channel dropped before the update was sent")]
    NotSent,

    #[error("session ended by server; sign in again")]
    LoggedOut,
}

pub type WatchResult<T> = Result<T, WatchError>;
