use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use clap::Args;
use live_channel::{
    Event, EventKind, HttpFetcher, LifecycleSignal, MonitorOptions, Projection, SessionGuard,
    SnapshotFetcher, TopicMonitor,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use super::{Client, ClientArgs, recv_signal};
use crate::error::{WatchError, WatchResult};
use crate::notifier::ConsoleNotifier;

#[derive(Args)]
pub struct WatchArgs {
    #[command(flatten)]
    client: ClientArgs,
    /// Only watch these topics (repeatable; default: every configured topic)
    #[arg(long = "topic")]
    topics: Vec<String>,
}

/// One printed line per projection change.
#[derive(Serialize)]
struct Line<'a> {
    ts: String,
    topic: &'a str,
    connected: bool,
    loading: bool,
    /// Milliseconds since the data was last written.
    age_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    data: Option<&'a serde_json::Value>,
}

fn render(topic: &str, projection: &Projection) -> String {
    let line = Line {
        ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        topic,
        connected: projection.connected,
        loading: projection.loading,
        age_ms: projection.last_update.map(|at| at.elapsed().as_millis()),
        error: projection.error.as_ref().map(|e| e.to_string()),
        data: projection.data.as_ref(),
    };
    serde_json::to_string(&line).unwrap_or_default()
}

/// Print a projection whenever its data, error or connection flag changes.
/// Pure `loading` flips are not worth a line.
async fn print_changes(topic: String, mut rx: watch::Receiver<Projection>) {
    let mut last_key = None;
    loop {
        let line = {
            let projection = rx.borrow_and_update();
            let key = (
                projection.last_update,
                projection.connected,
                projection.error.as_ref().map(|e| e.to_string()),
            );
            if last_key.as_ref() == Some(&key) {
                None
            } else {
                last_key = Some(key);
                Some(render(&topic, &projection))
            }
        };
        if let Some(line) = line {
            println!("{line}");
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

pub async fn run_watch(args: WatchArgs) -> WatchResult<()> {
    let client = Client::from_args(args.client).await?;
    let config = &client.config;
    let manager = &client.manager;

    let topics: Vec<_> = config
        .topics
        .iter()
        .filter(|t| args.topics.is_empty() || args.topics.contains(&t.name))
        .collect();
    if topics.is_empty() {
        return Err(WatchError::Config("no topics to watch".into()));
    }
    for name in &args.topics {
        if !config.topics.iter().any(|t| &t.name == name) {
            return Err(WatchError::Config(format!("unknown topic: {name}")));
        }
    }

    let notifier = Arc::new(ConsoleNotifier::default());
    let _guard = SessionGuard::install(
        manager,
        Arc::clone(&client.credentials),
        notifier.clone(),
        config.session.clone(),
    );

    manager.on(EventKind::ReconnectExhausted, |event| {
        if let Event::ReconnectExhausted { attempts } = event {
            warn!(attempts, "Live channel gave up; continuing on polling only");
        }
    });
    manager.on(EventKind::CredentialRequired, |_| {
        warn!("No usable access token; refresh the token file to go live");
    });

    let fetcher: Arc<dyn SnapshotFetcher> = Arc::new(HttpFetcher::new(
        config.fetch_config(),
        Arc::clone(&client.credentials),
    )?);

    let mut monitors = Vec::with_capacity(topics.len());
    for topic in topics {
        let name = topic.name.clone();
        let options = MonitorOptions::new(&topic.name)
            .poll_interval(topic.poll_interval())
            .enabled(topic.enabled)
            .on_error(move |e| warn!(topic = %name, "Refresh failed: {e}"));
        let monitor = TopicMonitor::new(manager, Arc::clone(&fetcher), options);
        tokio::spawn(print_changes(topic.name.clone(), monitor.watch()));
        info!(topic = %topic.name, enabled = topic.enabled, "Watching");
        monitors.push(monitor);
    }

    // -----------------------------------------------------------------------
    // Signal handling
    // -----------------------------------------------------------------------
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sighup = signal(SignalKind::hangup()).ok();

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, stopping");
                break Ok(());
            }
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, stopping");
                break Ok(());
            }
            _ = recv_signal(&mut sighup) => {
                info!("received SIGHUP, reconnecting and refreshing");
                manager.refresh_credentials();
                manager.handle_lifecycle(LifecycleSignal::NetworkOnline);
                for monitor in &monitors {
                    monitor.refresh();
                }
            }
            _ = notifier.logged_out() => {
                break Err(WatchError::LoggedOut);
            }
        }
    };

    drop(monitors);
    manager.disconnect_and_wait().await;
    manager.shutdown();
    result
}
