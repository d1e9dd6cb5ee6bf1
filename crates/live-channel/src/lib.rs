//! Resilient real-time update client.
//!
//! A single [`ConnectionManager`] owns the shared push channel and keeps it
//! alive with bounded exponential backoff. Any number of [`TopicMonitor`]s
//! ride on it, each merging push updates with a polling fallback into one
//! [`Projection`]. A [`SessionGuard`] routes server-initiated session
//! termination: token rotation reconnects, anything else logs the user out.

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod fetch;
mod listeners;
pub mod monitor;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

pub use config::{ConnectionConfig, FetchConfig, SessionConfig};
pub use connection::{ConnectionManager, WeakConnectionManager, backoff_delay};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore, Token};
pub use error::{CredentialError, Error, FetchError, Result, TransportError};
pub use fetch::{HttpFetcher, SnapshotFetcher};
pub use listeners::{Listener, ListenerId};
pub use monitor::{MonitorOptions, Projection, TopicMonitor};
pub use session::{SessionGuard, SessionNotifier};
pub use transport::{Channel, Transport, WsTransport};
pub use types::{
    ConnectionState, Event, EventKind, ForcedLogout, Inbound, LifecycleSignal, Outbound,
    ServerEvent, TopicUpdate,
};
