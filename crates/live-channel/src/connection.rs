//! Connection management: the shared channel, its reconnect state machine and
//! listener dispatch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ConnectionConfig;
use crate::credentials::{CredentialStore, Token};
use crate::listeners::{Listener, ListenerId, ListenerRegistry};
use crate::error::TransportError;
use crate::transport::{Channel, Transport};
use crate::types::{ConnectionState, Event, EventKind, Inbound, LifecycleSignal, Outbound, ServerEvent};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Extra silence tolerated after a missed keepalive before the channel is
/// considered dead.
const HEARTBEAT_MARGIN: Duration = Duration::from_secs(20);

/// Reconnect delay for the given attempt number (1-based):
/// `min(base * 2^(attempt-1), max)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(30);
    base.saturating_mul(1u32 << exp).min(max)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// `connect()` from a caller: min-interval and attempt cap apply.
    Caller,
    /// A reconnect timer fired; the scheduler already applied both checks.
    Scheduled,
}

enum Scheduled {
    Armed,
    Exhausted(u32),
}

struct Session {
    outbound: mpsc::UnboundedSender<Outbound>,
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Session {
    /// Ask the session task to close its channel. The returned handle
    /// resolves once it has.
    fn close(mut self) -> JoinHandle<()> {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        self.task
    }
}

struct PendingReconnect {
    id: u64,
    task: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    session: Option<Session>,
    /// Bumped on every open attempt and every teardown. Callbacks carrying an
    /// older value belong to a channel we no longer own.
    generation: u64,
    reconnect_attempts: u32,
    last_attempt_at: Option<Instant>,
    pending_reconnect: Option<PendingReconnect>,
    timer_seq: u64,
    intentional_disconnect: bool,
    shut_down: bool,
    listeners: ListenerRegistry,
}

impl Inner {
    fn clear_pending_reconnect(&mut self) {
        if let Some(pending) = self.pending_reconnect.take() {
            pending.task.abort();
        }
    }
}

struct Shared {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Owner of the single shared channel.
///
/// Cloning is a cheap `Arc` bump; every clone drives the same channel. Create
/// one per process with [`ConnectionManager::new`] and tear it down with
/// [`ConnectionManager::shutdown`]. Methods never block and never fail:
/// problems are logged and surfaced as [`Event`]s.
///
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

/// Non-owning handle, for callbacks registered on the manager itself.
#[derive(Clone)]
pub struct WeakConnectionManager {
    shared: Weak<Shared>,
}

impl WeakConnectionManager {
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.shared.upgrade().map(|shared| ConnectionManager { shared })
    }
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                credentials,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    session: None,
                    generation: 0,
                    reconnect_attempts: 0,
                    last_attempt_at: None,
                    pending_reconnect: None,
                    timer_seq: 0,
                    intentional_disconnect: false,
                    shut_down: false,
                    listeners: ListenerRegistry::default(),
                }),
                state_tx,
            }),
        }
    }

    /// Open the channel unless it is already open or opening, the previous
    /// attempt was too recent, or the attempt budget is spent.
    pub fn connect(&self) {
        self.shared.try_connect(Origin::Caller);
    }

    /// Close the channel and stop reconnecting until the next `connect()`.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// `disconnect()`, then wait until frames already handed to `emit()` are
    /// written and the channel is closed.
    pub async fn disconnect_and_wait(&self) {
        if let Some(task) = self.shared.disconnect()
            && let Err(e) = task.await
        {
            tracing::debug!("Session task ended abnormally: {e}");
        }
    }

    /// Entry point for environment triggers (visibility restored, network
    /// back online). Resets the attempt budget, subject to the same minimum
    /// interval as `connect()`. Ignored after an intentional disconnect.
    pub fn request_reconnect(&self) {
        self.shared.request_reconnect();
    }

    pub fn handle_lifecycle(&self, signal: LifecycleSignal) {
        match signal {
            LifecycleSignal::VisibilityRestored | LifecycleSignal::NetworkOnline => {
                tracing::debug!(?signal, "Lifecycle trigger, requesting reconnect");
                self.request_reconnect();
            }
            LifecycleSignal::NetworkOffline => {
                tracing::info!("Network offline; waiting for it to come back");
            }
        }
    }

    /// Drop the current channel and open a new one with the current
    /// credential, honoring whatever remains of the minimum interval.
    pub fn reconnect(&self) {
        self.shared.reconnect();
    }

    /// Call after a fresh credential has been stored: resets the attempt
    /// budget so `connect()` may proceed again.
    pub fn refresh_credentials(&self) {
        let mut inner = self.shared.lock();
        inner.reconnect_attempts = 0;
        tracing::debug!("Credentials refreshed, reconnect budget reset");
    }

    /// Register a listener. Listeners for the same kind run in registration
    /// order.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.shared.lock().listeners.add(kind, listener)
    }

    /// Remove one listener, or all listeners for `kind` when `id` is `None`.
    pub fn off(&self, kind: &EventKind, id: Option<ListenerId>) -> usize {
        self.shared.lock().listeners.remove(kind, id)
    }

    /// Send a frame on the shared channel. Returns `false` (and drops the
    /// frame) unless the channel is connected.
    pub fn emit(&self, frame: Outbound) -> bool {
        let inner = self.shared.lock();
        if inner.state != ConnectionState::Connected {
            tracing::debug!(state = %inner.state, "Not connected, dropping outbound frame");
            return false;
        }
        match &inner.session {
            Some(session) => session.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().reconnect_attempts
    }

    /// `true` once the reconnect budget is spent; only `refresh_credentials()`
    /// or a lifecycle trigger re-arms it.
    pub fn is_exhausted(&self) -> bool {
        self.shared.lock().reconnect_attempts >= self.shared.config.max_reconnect_attempts
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn listener_count(&self, kind: &EventKind) -> usize {
        self.shared.lock().listeners.count(kind)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Process teardown: disconnect, drop every listener, refuse further
    /// connects.
    pub fn shutdown(&self) {
        self.shared.disconnect();
        let mut inner = self.shared.lock();
        inner.shut_down = true;
        inner.listeners.clear();
        tracing::info!("Connection manager shut down");
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            tracing::trace!(from = %inner.state, to = %state, "Connection state change");
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn try_connect(self: &Arc<Self>, origin: Origin) {
        let mut inner = self.lock();
        if inner.shut_down {
            tracing::debug!("Manager shut down, ignoring connect");
            return;
        }
        if inner.state.is_active() {
            tracing::trace!(state = %inner.state, "Already connecting or connected");
            return;
        }
        if origin == Origin::Caller {
            let min_interval = self.config.min_connect_interval();
            if let Some(last) = inner.last_attempt_at
                && last.elapsed() < min_interval
            {
                tracing::debug!(?min_interval, "Connect attempt too soon after the previous one");
                return;
            }
            if inner.reconnect_attempts >= self.config.max_reconnect_attempts {
                tracing::debug!(
                    attempts = inner.reconnect_attempts,
                    "Reconnect budget spent; refresh credentials to retry"
                );
                return;
            }
        }

        let token = match self.credentials.current() {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Not connecting: {e}");
                drop(inner);
                if origin == Origin::Caller {
                    self.dispatch(Event::CredentialRequired);
                }
                return;
            }
        };

        inner.intentional_disconnect = false;
        inner.last_attempt_at = Some(Instant::now());
        inner.clear_pending_reconnect();
        inner.generation += 1;
        let generation = inner.generation;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        tracing::info!(generation, url = %self.config.url, "Opening channel");
        // `spawn` never polls inline, so this is safe under the lock.
        let task = tokio::spawn(run_session(
            Arc::clone(self),
            generation,
            token,
            outbound_rx,
            close_rx,
        ));
        if let Some(stale) = inner.session.replace(Session {
            outbound: outbound_tx,
            close_tx: Some(close_tx),
            task,
        }) {
            stale.close();
        }
        self.set_state(&mut inner, ConnectionState::Connecting);
    }

    fn disconnect(&self) -> Option<JoinHandle<()>> {
        let mut inner = self.lock();
        inner.intentional_disconnect = true;
        inner.generation += 1;
        inner.clear_pending_reconnect();
        inner.reconnect_attempts = 0;
        let was = inner.state;
        self.set_state(&mut inner, ConnectionState::Disconnecting);
        let task = inner.session.take().map(Session::close);
        self.set_state(&mut inner, ConnectionState::Idle);
        drop(inner);

        if was != ConnectionState::Idle {
            tracing::info!("Disconnected by client");
            self.dispatch(Event::Disconnected {
                reason: Some("client disconnect".to_string()),
            });
        }
        task
    }

    fn request_reconnect(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.shut_down || inner.intentional_disconnect || inner.state.is_active() {
                return;
            }
            if let Some(last) = inner.last_attempt_at
                && last.elapsed() < self.config.min_connect_interval()
            {
                tracing::debug!("Reconnect request too soon after the previous attempt");
                return;
            }
            inner.reconnect_attempts = 0;
            inner.clear_pending_reconnect();
        }
        self.try_connect(Origin::Caller);
    }

    fn reconnect(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.shut_down {
            return;
        }
        inner.generation += 1;
        if let Some(session) = inner.session.take() {
            session.close();
        }
        inner.intentional_disconnect = false;
        inner.reconnect_attempts = 0;
        self.set_state(&mut inner, ConnectionState::Idle);
        let wait = inner.last_attempt_at.map_or(Duration::ZERO, |last| {
            self.config.min_connect_interval().saturating_sub(last.elapsed())
        });
        tracing::info!(?wait, "Reconnecting with current credentials");
        self.arm_reconnect(&mut inner, wait);
    }

    // -----------------------------------------------------------------------
    // Session callbacks
    // -----------------------------------------------------------------------

    /// Returns `false` when the session is stale and should close itself.
    fn handle_open(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || inner.session.is_none() || inner.shut_down {
            return false;
        }
        inner.reconnect_attempts = 0;
        inner.clear_pending_reconnect();
        self.set_state(&mut inner, ConnectionState::Connected);
        drop(inner);

        tracing::info!(generation, "Channel connected");
        self.dispatch(Event::Connected);
        true
    }

    fn handle_closed(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            tracing::debug!(generation, "Ignoring close from a stale channel");
            return;
        }
        inner.session = None;
        self.set_state(&mut inner, ConnectionState::Idle);
        if inner.intentional_disconnect || inner.shut_down {
            return;
        }
        let scheduled = self.schedule_reconnect(&mut inner);
        drop(inner);

        self.dispatch(Event::Disconnected { reason });
        if let Scheduled::Exhausted(attempts) = scheduled {
            self.dispatch(Event::ReconnectExhausted { attempts });
        }
    }

    fn handle_server_event(&self, generation: u64, event: ServerEvent) {
        if self.lock().generation != generation {
            return;
        }
        self.dispatch(event.into());
    }

    fn dispatch(&self, event: Event) {
        let listeners = self.lock().listeners.matching(&event.kind());
        for listener in listeners {
            listener(&event);
        }
    }

    // -----------------------------------------------------------------------
    // Reconnect scheduler
    // -----------------------------------------------------------------------

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) -> Scheduled {
        let max_attempts = self.config.max_reconnect_attempts;
        if inner.reconnect_attempts >= max_attempts {
            tracing::warn!(attempts = inner.reconnect_attempts, "Giving up reconnecting");
            return Scheduled::Exhausted(inner.reconnect_attempts);
        }
        inner.reconnect_attempts += 1;
        let delay = backoff_delay(
            inner.reconnect_attempts,
            self.config.base_delay(),
            self.config.max_delay(),
        );
        tracing::info!(
            attempt = inner.reconnect_attempts,
            max_attempts,
            ?delay,
            "Scheduling reconnect"
        );
        self.arm_reconnect(inner, delay);
        Scheduled::Armed
    }

    /// Replace any pending reconnect timer with one firing after `delay`.
    fn arm_reconnect(self: &Arc<Self>, inner: &mut Inner, delay: Duration) {
        inner.clear_pending_reconnect();
        inner.timer_seq += 1;
        let id = inner.timer_seq;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.fire_reconnect(id);
            }
        });
        inner.pending_reconnect = Some(PendingReconnect { id, task });
    }

    fn fire_reconnect(self: &Arc<Self>, id: u64) {
        {
            let mut inner = self.lock();
            match &inner.pending_reconnect {
                Some(pending) if pending.id == id => inner.pending_reconnect = None,
                _ => return,
            }
            if inner.shut_down || inner.intentional_disconnect {
                return;
            }
        }
        if !self.credentials.is_valid() {
            tracing::info!("Credential no longer valid, abandoning reconnect");
            return;
        }
        self.try_connect(Origin::Scheduled);
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

/// Sleep until `at`, or pend forever if there is no deadline.
async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run_session(
    shared: Arc<Shared>,
    generation: u64,
    token: Token,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let connect_timeout = shared.config.connect_timeout();
    let opened = tokio::select! {
        result = tokio::time::timeout(connect_timeout, shared.transport.open(&token)) => result,
        _ = &mut close_rx => {
            tracing::debug!(generation, "Close requested before channel opened");
            return;
        }
    };
    let mut channel: Box<dyn Channel> = match opened {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            tracing::warn!(generation, "Channel open failed: {e}");
            shared.handle_closed(generation, Some(e.to_string()));
            return;
        }
        Err(_) => {
            tracing::warn!(generation, ?connect_timeout, "Channel open timed out");
            shared.handle_closed(generation, Some(TransportError::Timeout.to_string()));
            return;
        }
    };
    if !shared.handle_open(generation) {
        channel.close().await;
        return;
    }

    let keepalive = shared.config.keepalive_interval();
    let mut last_seen = Instant::now();
    let mut next_ping = keepalive.map(|k| Instant::now() + k);

    loop {
        let idle_deadline = keepalive.map(|k| last_seen + k + HEARTBEAT_MARGIN);

        // Queued outbound frames go out before a close is honored.
        tokio::select! {
            biased;

            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = channel.send(frame).await {
                    tracing::warn!(generation, "Send failed: {e}");
                    channel.close().await;
                    shared.handle_closed(generation, Some(e.to_string()));
                    return;
                }
            }

            frame = channel.recv() => {
                match frame {
                    Some(Ok(Inbound::Event(event))) => {
                        last_seen = Instant::now();
                        shared.handle_server_event(generation, event);
                    }
                    Some(Ok(Inbound::Heartbeat)) => {
                        last_seen = Instant::now();
                        tracing::trace!("Heartbeat received");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(generation, "Channel error: {e}");
                        shared.handle_closed(generation, Some(e.to_string()));
                        return;
                    }
                    None => {
                        tracing::info!(generation, "Channel closed by server");
                        shared.handle_closed(generation, None);
                        return;
                    }
                }
            }

            _ = sleep_until_opt(next_ping) => {
                next_ping = keepalive.map(|k| Instant::now() + k);
                if let Err(e) = channel.ping().await {
                    tracing::warn!(generation, "Keepalive ping failed: {e}");
                    channel.close().await;
                    shared.handle_closed(generation, Some(e.to_string()));
                    return;
                }
            }

            _ = sleep_until_opt(idle_deadline) => {
                tracing::warn!(generation, "Heartbeat timeout");
                channel.close().await;
                shared.handle_closed(generation, Some("heartbeat timeout".to_string()));
                return;
            }

            _ = &mut close_rx => {
                tracing::debug!(generation, "Close requested");
                channel.close().await;
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
