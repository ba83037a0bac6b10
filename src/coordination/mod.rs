//! Coordination service boundary.
//!
//! The directory only needs one primitive: read a node and subscribe to its
//! next change. Subscriptions are one-shot with respect to node events
//! (`NodeDataChanged` / `NodeDeleted` consume them); session events may be
//! delivered any number of times before that.

pub mod memory;
pub mod zookeeper;

use async_trait::async_trait;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryCoordinator;
pub use zookeeper::ZooKeeperClient;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("node '{0}' does not exist")]
    NoNode(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server returned error code {code} for '{path}'")]
    Server { code: i32, path: String },

    #[error("client is closed")]
    Closed,
}

impl From<io::Error> for CoordinationError {
    fn from(err: io::Error) -> Self {
        // framing codecs report malformed packets as InvalidData
        match err.kind() {
            io::ErrorKind::InvalidData => CoordinationError::Protocol(err.to_string()),
            _ => CoordinationError::Connection(err.to_string()),
        }
    }
}

/// Node-level event type, numbered as on the ZooKeeper wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Session state change, not tied to a node.
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

impl WatchEventKind {
    pub fn from_wire(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::None),
            1 => Some(Self::NodeCreated),
            2 => Some(Self::NodeDeleted),
            3 => Some(Self::NodeDataChanged),
            4 => Some(Self::NodeChildrenChanged),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::None => -1,
            Self::NodeCreated => 1,
            Self::NodeDeleted => 2,
            Self::NodeDataChanged => 3,
            Self::NodeChildrenChanged => 4,
        }
    }

    /// Whether this event consumes the watch it is delivered on.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::NodeDeleted | Self::NodeDataChanged)
    }
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "EventNone",
            Self::NodeCreated => "EventNodeCreated",
            Self::NodeDeleted => "EventNodeDeleted",
            Self::NodeDataChanged => "EventNodeDataChanged",
            Self::NodeChildrenChanged => "EventNodeChildrenChanged",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    SyncConnected,
    Expired,
    Unknown(i32),
}

impl SessionState {
    pub fn from_wire(code: i32) -> Self {
        match code {
            0 => Self::Disconnected,
            3 => Self::SyncConnected,
            -112 => Self::Expired,
            other => Self::Unknown(other),
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::Disconnected => 0,
            Self::SyncConnected => 3,
            Self::Expired => -112,
            Self::Unknown(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub state: SessionState,
    pub path: String,
}

impl WatchEvent {
    pub fn node(kind: WatchEventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            state: SessionState::SyncConnected,
            path: path.into(),
        }
    }

    pub fn session(state: SessionState, path: impl Into<String>) -> Self {
        Self {
            kind: WatchEventKind::None,
            state,
            path: path.into(),
        }
    }
}

/// Receiving side of an armed watch.
///
/// Dropping the subscription disarms it from the subscriber's point of view;
/// the coordination client notices through [`WatchNotifier::is_closed`].
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Subscription {
    pub fn channel() -> (WatchNotifier, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WatchNotifier { tx }, Subscription { rx })
    }

    /// Next event, or `None` once the client dropped the watch.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Sending side of an armed watch, held by the coordination client.
#[derive(Debug, Clone)]
pub struct WatchNotifier {
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl WatchNotifier {
    /// Returns false when the subscriber is gone.
    pub fn notify(&self, event: WatchEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read-with-watch capability against a hierarchical namespace.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Reads the node at `path` and arms a fresh data watch on it.
    async fn get_data_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, Subscription), CoordinationError>;

    /// Releases the session. Armed watches are dropped.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_codes() {
        for kind in [
            WatchEventKind::None,
            WatchEventKind::NodeCreated,
            WatchEventKind::NodeDeleted,
            WatchEventKind::NodeDataChanged,
            WatchEventKind::NodeChildrenChanged,
        ] {
            assert_eq!(WatchEventKind::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(WatchEventKind::from_wire(42), None);
        assert!(WatchEventKind::NodeDeleted.is_terminal());
        assert!(!WatchEventKind::NodeChildrenChanged.is_terminal());
    }

    #[tokio::test]
    async fn test_subscription_closes_with_notifier() {
        let (notifier, mut sub) = Subscription::channel();
        assert!(notifier.notify(WatchEvent::node(WatchEventKind::NodeDataChanged, "/r/t")));
        drop(notifier);
        let event = sub.next().await.unwrap();
        assert_eq!(event.path, "/r/t");
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_notifier_sees_dropped_subscription() {
        let (notifier, sub) = Subscription::channel();
        assert!(!notifier.is_closed());
        drop(sub);
        assert!(notifier.is_closed());
        assert!(!notifier.notify(WatchEvent::session(SessionState::Disconnected, "")));
    }
}
