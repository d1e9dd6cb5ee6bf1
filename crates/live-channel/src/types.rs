//! Public types for the live-channel crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// `true` while an open attempt is in flight or the channel is up.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// An update for one topic, received from the server or broadcast by us.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicUpdate {
    /// Topic name (e.g. `"properties"`).
    pub topic: String,
    /// Kind of change (`"update"`, `"created"`, `"deleted"`, ...).
    pub kind: String,
    /// Snapshot payload.
    pub data: serde_json::Value,
    /// Server-assigned id, used to drop duplicate announcements.
    pub id: Option<String>,
    /// Server timestamp (milliseconds since epoch).
    pub timestamp: Option<i64>,
}

impl TopicUpdate {
    pub fn new(topic: impl Into<String>, kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            kind: kind.into(),
            data,
            id: None,
            timestamp: None,
        }
    }
}

/// Server-initiated session end.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForcedLogout {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Events decoded from the wire. Only these can reach listeners from the
/// transport side; lifecycle events are produced by the manager itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Topic-scoped update (`<topic>_update`).
    TopicUpdate(TopicUpdate),
    /// Cross-topic update (`data_update`); listeners filter by topic.
    DataUpdate(TopicUpdate),
    /// Forced session termination.
    ForcedLogout(ForcedLogout),
    /// Any other named event.
    Custom {
        name: String,
        data: serde_json::Value,
    },
}

/// What a [`Channel`](crate::Channel) yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(ServerEvent),
    /// Ping/pong or other liveness-only traffic.
    Heartbeat,
}

/// Frames we send on the shared channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Topic-tagged update relayed to other clients.
    Broadcast(TopicUpdate),
    Custom {
        name: String,
        data: serde_json::Value,
    },
}

/// Events delivered to listeners registered with
/// [`ConnectionManager::on`](crate::ConnectionManager::on).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The channel opened.
    Connected,
    /// The channel dropped or was closed.
    Disconnected { reason: Option<String> },
    /// The reconnect scheduler gave up.
    ReconnectExhausted { attempts: u32 },
    /// `connect()` found no usable credential.
    CredentialRequired,
    /// Server ended the session.
    ForcedLogout(ForcedLogout),
    TopicUpdate(TopicUpdate),
    DataUpdate(TopicUpdate),
    Custom {
        name: String,
        data: serde_json::Value,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connected => EventKind::Connected,
            Event::Disconnected { .. } => EventKind::Disconnected,
            Event::ReconnectExhausted { .. } => EventKind::ReconnectExhausted,
            Event::CredentialRequired => EventKind::CredentialRequired,
            Event::ForcedLogout(_) => EventKind::ForcedLogout,
            Event::TopicUpdate(update) => EventKind::Topic(update.topic.clone()),
            Event::DataUpdate(_) => EventKind::DataUpdate,
            Event::Custom { name, .. } => EventKind::Custom(name.clone()),
        }
    }
}

impl From<ServerEvent> for Event {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::TopicUpdate(update) => Event::TopicUpdate(update),
            ServerEvent::DataUpdate(update) => Event::DataUpdate(update),
            ServerEvent::ForcedLogout(logout) => Event::ForcedLogout(logout),
            ServerEvent::Custom { name, data } => Event::Custom { name, data },
        }
    }
}

/// Listener registration key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    ReconnectExhausted,
    CredentialRequired,
    ForcedLogout,
    /// Topic-scoped updates for one topic.
    Topic(String),
    /// Cross-topic updates for every topic.
    DataUpdate,
    Custom(String),
}

/// Environment signals that warrant an immediate reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The consumer became visible/foregrounded again.
    VisibilityRestored,
    NetworkOnline,
    NetworkOffline,
}
