mod broadcast;
mod watch;

pub use broadcast::{BroadcastArgs, run_broadcast};
pub use watch::{WatchArgs, run_watch};

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use live_channel::{
    ConnectionManager, CredentialStore, FileCredentialStore, MemoryCredentialStore, Token,
    WsTransport,
};

use crate::config::{self, ClientConfig};
use crate::error::{WatchError, WatchResult};

/// Options shared by every subcommand.
#[derive(Args)]
pub struct ClientArgs {
    /// Path to the live-watch YAML config file
    #[arg(long, short)]
    config: PathBuf,
    /// WebSocket endpoint (overrides config)
    #[arg(long, env = "LIVE_WATCH_URL")]
    url: Option<String>,
    /// Snapshot API base URL (overrides config)
    #[arg(long, env = "LIVE_WATCH_API_URL")]
    api_url: Option<String>,
    /// Access token (overrides token_file)
    #[arg(long, env = "LIVE_WATCH_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

/// Everything a subcommand needs to talk to the server.
struct Client {
    config: ClientConfig,
    credentials: Arc<dyn CredentialStore>,
    manager: ConnectionManager,
}

impl Client {
    async fn from_args(args: ClientArgs) -> WatchResult<Self> {
        let mut config = config::load(&args.config).await?;

        // CLI / env overrides
        if let Some(url) = args.url {
            config.connection.url = url;
        }
        if let Some(api_url) = args.api_url {
            config.fetch.base_url = api_url;
        }
        config.validate()?;

        let credentials: Arc<dyn CredentialStore> = match (args.token, &config.token_file) {
            (Some(token), _) => Arc::new(MemoryCredentialStore::new(Some(Token::new(token)))),
            (None, Some(path)) => Arc::new(FileCredentialStore::new(path)),
            (None, None) => {
                return Err(WatchError::Config(
                    "no credential: pass --token or set token_file".into(),
                ));
            }
        };

        let transport = Arc::new(WsTransport::new(config.connection.url.clone()));
        let manager = ConnectionManager::new(
            config.connection.clone(),
            transport,
            Arc::clone(&credentials),
        );

        Ok(Self {
            config,
            credentials,
            manager,
        })
    }
}

async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
