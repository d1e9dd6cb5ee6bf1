use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Args;
use live_channel::{ConnectionState, Outbound, TopicUpdate};
use tracing::info;

use super::{Client, ClientArgs};
use crate::error::{WatchError, WatchResult};

#[derive(Args)]
pub struct BroadcastArgs {
    #[command(flatten)]
    client: ClientArgs,
    /// Topic to announce the change on
    #[arg(long)]
    topic: String,
    /// Change kind (update, created, deleted, ...)
    #[arg(long, default_value = "update")]
    kind: String,
    /// JSON payload
    #[arg(long)]
    data: String,
    /// Give up if the channel is not up within this many seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

pub async fn run_broadcast(args: BroadcastArgs) -> WatchResult<()> {
    let data: serde_json::Value = serde_json::from_str(&args.data)?;
    let client = Client::from_args(args.client).await?;
    let manager = &client.manager;

    let mut state = manager.watch_state();
    manager.connect();

    let timeout = Duration::from_secs(args.timeout_secs);
    let connected = matches!(
        tokio::time::timeout(timeout, state.wait_for(|s| *s == ConnectionState::Connected)).await,
        Ok(Ok(_))
    );
    if !connected {
        manager.shutdown();
        return Err(WatchError::ConnectTimeout(timeout));
    }

    let mut update = TopicUpdate::new(args.topic.as_str(), args.kind.as_str(), data);
    update.timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64);
    let sent = manager.emit(Outbound::Broadcast(update));

    manager.disconnect_and_wait().await;
    manager.shutdown();

    if !sent {
        return Err(WatchError::NotSent);
    }
    info!(topic = %args.topic, kind = %args.kind, "Broadcast sent");
    Ok(())
}
