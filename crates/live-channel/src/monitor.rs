//! Per-topic freshness: push updates from the shared channel and periodic
//! snapshot polling merged into one [`Projection`].
//!
//! Both sources write through the same path (replace `data`, stamp
//! `last_update`, clear `error`), so whichever arrives last wins. Ordering by
//! server version is left to the payload.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::connection::ConnectionManager;
use crate::error::Error;
use crate::fetch::SnapshotFetcher;
use crate::listeners::ListenerId;
use crate::types::{ConnectionState, Event, EventKind, Outbound, TopicUpdate};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub type UpdateCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// What a consumer reads. Always replaced or modified as a whole.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub data: Option<Value>,
    /// When `data` was last written, by either source.
    pub last_update: Option<Instant>,
    /// A snapshot fetch is in flight.
    pub loading: bool,
    /// Last fetch failure; cleared by the next successful write.
    pub error: Option<Arc<Error>>,
    /// Mirrors the shared channel, independent of this monitor being enabled.
    pub connected: bool,
}

#[derive(Clone)]
pub struct MonitorOptions {
    pub topic: String,
    /// Zero disables polling.
    pub poll_interval: Duration,
    pub enabled: bool,
    pub on_update: Option<UpdateCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl MonitorOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            enabled: true,
            on_update: None,
            on_error: None,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for MonitorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorOptions")
            .field("topic", &self.topic)
            .field("poll_interval", &self.poll_interval)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct MonitorState {
    enabled: bool,
    disposed: bool,
    /// Bumped on every start and stop; deferred work from an older value is
    /// dropped.
    generation: u64,
    poll_interval: Duration,
    poll_task: Option<JoinHandle<()>>,
    listeners: Vec<(EventKind, ListenerId)>,
    in_flight: u32,
    last_push_id: Option<String>,
}

impl MonitorState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.enabled && !self.disposed
    }
}

struct MonitorShared {
    topic: String,
    manager: ConnectionManager,
    fetcher: Arc<dyn SnapshotFetcher>,
    on_update: Option<UpdateCallback>,
    on_error: Option<ErrorCallback>,
    projection: watch::Sender<Projection>,
    state: Mutex<MonitorState>,
}

/// One logical topic kept fresh from push and poll.
///
/// Dropping the monitor disposes it. Disposal only removes this monitor's own
/// listeners; the shared channel stays up for everyone else.
pub struct TopicMonitor {
    shared: Arc<MonitorShared>,
    connection_watch: Option<JoinHandle<()>>,
}

impl TopicMonitor {
    /// Create the monitor and, if enabled, start it. Requires a tokio runtime.
    pub fn new(
        manager: &ConnectionManager,
        fetcher: Arc<dyn SnapshotFetcher>,
        options: MonitorOptions,
    ) -> Self {
        let connected = manager.is_connected();
        let (projection, _) = watch::channel(Projection {
            connected,
            ..Default::default()
        });
        let shared = Arc::new(MonitorShared {
            topic: options.topic,
            manager: manager.clone(),
            fetcher,
            on_update: options.on_update,
            on_error: options.on_error,
            projection,
            state: Mutex::new(MonitorState {
                enabled: options.enabled,
                disposed: false,
                generation: 0,
                poll_interval: options.poll_interval,
                poll_task: None,
                listeners: Vec::new(),
                in_flight: 0,
                last_push_id: None,
            }),
        });

        let connection_watch = Some(tokio::spawn(mirror_connection(
            Arc::downgrade(&shared),
            manager.watch_state(),
        )));

        tracing::debug!(topic = %shared.topic, enabled = options.enabled, "Topic monitor created");
        shared.start();
        Self {
            shared,
            connection_watch,
        }
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Current snapshot of the projection.
    pub fn projection(&self) -> Projection {
        self.shared.projection.borrow().clone()
    }

    /// Subscribe to projection changes.
    pub fn watch(&self) -> watch::Receiver<Projection> {
        self.shared.projection.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        let st = self.shared.lock();
        st.enabled && !st.disposed
    }

    /// Fetch a snapshot now, outside the poll cadence. Concurrent refreshes
    /// race; the last to resolve wins.
    pub fn refresh(&self) {
        let generation = {
            let st = self.shared.lock();
            if !st.enabled || st.disposed {
                return;
            }
            st.generation
        };
        tokio::spawn(Arc::clone(&self.shared).run_fetch(generation));
    }

    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut st = self.shared.lock();
            if st.disposed || st.enabled == enabled {
                return;
            }
            st.enabled = enabled;
        }
        if enabled {
            self.shared.start();
        } else {
            self.shared.stop();
        }
    }

    /// Change the poll cadence; restarts the poll timer when active.
    pub fn set_poll_interval(&self, interval: Duration) {
        let mut st = self.shared.lock();
        st.poll_interval = interval;
        if !st.enabled || st.disposed {
            return;
        }
        if let Some(task) = st.poll_task.take() {
            task.abort();
        }
        let generation = st.generation;
        st.poll_task = self.shared.spawn_poll(generation, interval);
    }

    /// Relay an update for this topic to other clients. `false` when the
    /// channel is not connected; nothing is queued.
    pub fn broadcast(&self, payload: Value, kind: &str) -> bool {
        if self.shared.lock().disposed {
            return false;
        }
        let mut update = TopicUpdate::new(self.shared.topic.clone(), kind, payload);
        update.timestamp = Some(now_millis());
        self.shared.manager.emit(Outbound::Broadcast(update))
    }

    /// Stop polling and remove this monitor's listeners. Idempotent.
    pub fn dispose(&mut self) {
        {
            let mut st = self.shared.lock();
            if st.disposed {
                return;
            }
            st.disposed = true;
        }
        self.shared.stop();
        if let Some(task) = self.connection_watch.take() {
            task.abort();
        }
        tracing::debug!(topic = %self.shared.topic, "Topic monitor disposed");
    }
}

impl Drop for TopicMonitor {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ---------------------------------------------------------------------------
// Start / stop
// ---------------------------------------------------------------------------

impl MonitorShared {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(self: &Arc<Self>) {
        let (generation, poll_interval) = {
            let mut st = self.lock();
            if !st.enabled || st.disposed {
                return;
            }
            st.generation += 1;
            st.last_push_id = None;
            (st.generation, st.poll_interval)
        };

        tokio::spawn(Arc::clone(self).run_fetch(generation));
        self.manager.connect();

        let topic_kind = EventKind::Topic(self.topic.clone());
        let topic_id = self.manager.on(topic_kind.clone(), self.push_listener(generation));
        let data_id = self
            .manager
            .on(EventKind::DataUpdate, self.push_listener(generation));

        let mut st = self.lock();
        if st.generation != generation {
            // Stopped while we were registering.
            drop(st);
            self.manager.off(&topic_kind, Some(topic_id));
            self.manager.off(&EventKind::DataUpdate, Some(data_id));
            return;
        }
        st.listeners = vec![(topic_kind, topic_id), (EventKind::DataUpdate, data_id)];
        st.poll_task = self.spawn_poll(generation, poll_interval);
        tracing::debug!(topic = %self.topic, ?poll_interval, "Topic monitor started");
    }

    fn stop(&self) {
        let listeners = {
            let mut st = self.lock();
            st.generation += 1;
            if let Some(task) = st.poll_task.take() {
                task.abort();
            }
            st.in_flight = 0;
            self.projection.send_if_modified(|p| std::mem::replace(&mut p.loading, false));
            std::mem::take(&mut st.listeners)
        };
        for (kind, id) in listeners {
            self.manager.off(&kind, Some(id));
        }
        tracing::debug!(topic = %self.topic, "Topic monitor stopped");
    }

    fn push_listener(self: &Arc<Self>, generation: u64) -> impl Fn(&Event) + Send + Sync + 'static {
        let weak = Arc::downgrade(self);
        move |event| {
            let update = match event {
                Event::TopicUpdate(update) | Event::DataUpdate(update) => update,
                _ => return,
            };
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if update.topic == shared.topic {
                shared.apply_push(generation, update);
            }
        }
    }

    fn spawn_poll(self: &Arc<Self>, generation: u64, period: Duration) -> Option<JoinHandle<()>> {
        if period.is_zero() {
            return None;
        }
        Some(tokio::spawn(poll_loop(Arc::downgrade(self), generation, period)))
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    fn apply_push(&self, generation: u64, update: &TopicUpdate) {
        {
            let mut st = self.lock();
            if !st.is_current(generation) {
                return;
            }
            if let Some(id) = &update.id {
                if st.last_push_id.as_ref() == Some(id) {
                    tracing::trace!(topic = %self.topic, id, "Duplicate push ignored");
                    return;
                }
                st.last_push_id = Some(id.clone());
            }
            let loading = st.in_flight > 0;
            self.write_data(update.data.clone(), loading);
        }
        tracing::trace!(topic = %self.topic, kind = %update.kind, "Push applied");
        if let Some(cb) = &self.on_update {
            cb(&update.data);
        }
    }

    /// Replace `data` and stamp it. Called with the state lock held.
    fn write_data(&self, data: Value, loading: bool) {
        self.projection.send_modify(|p| {
            p.data = Some(data);
            p.last_update = Some(Instant::now());
            p.error = None;
            p.loading = loading;
        });
    }

    async fn run_fetch(self: Arc<Self>, generation: u64) {
        {
            let mut st = self.lock();
            if !st.is_current(generation) {
                return;
            }
            st.in_flight += 1;
            self.projection.send_if_modified(|p| !std::mem::replace(&mut p.loading, true));
        }

        let result = self.fetcher.fetch(&self.topic).await;

        let outcome = {
            let mut st = self.lock();
            if !st.is_current(generation) {
                tracing::debug!(topic = %self.topic, "Dropping stale fetch result");
                return;
            }
            st.in_flight = st.in_flight.saturating_sub(1);
            let loading = st.in_flight > 0;
            match result {
                Ok(data) => {
                    let seen = self.on_update.as_ref().map(|_| data.clone());
                    self.write_data(data, loading);
                    Ok(seen)
                }
                Err(e) => {
                    let err = Arc::new(Error::from(e));
                    self.projection.send_modify(|p| {
                        p.error = Some(Arc::clone(&err));
                        p.loading = loading;
                    });
                    Err(err)
                }
            }
        };

        match outcome {
            Ok(seen) => {
                if let (Some(cb), Some(data)) = (&self.on_update, seen) {
                    cb(&data);
                }
            }
            Err(err) => {
                tracing::warn!(topic = %self.topic, "Snapshot fetch failed: {err}");
                if let Some(cb) = &self.on_error {
                    cb(&err);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn poll_loop(weak: Weak<MonitorShared>, generation: u64, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if !shared.lock().is_current(generation) {
            return;
        }
        shared.run_fetch(generation).await;
    }
}

async fn mirror_connection(weak: Weak<MonitorShared>, mut rx: watch::Receiver<ConnectionState>) {
    loop {
        let connected = *rx.borrow_and_update() == ConnectionState::Connected;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        shared.projection.send_if_modified(|p| {
            let changed = p.connected != connected;
            p.connected = connected;
            changed
        });
        drop(shared);
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
