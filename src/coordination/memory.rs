use super::{
    CoordinationClient, CoordinationError, SessionState, Subscription, WatchEvent, WatchEventKind,
    WatchNotifier,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Namespace {
    nodes: HashMap<String, Vec<u8>>,
    watches: HashMap<String, Vec<WatchNotifier>>,
    injected_error: Option<CoordinationError>,
    fetch_delay: Option<Duration>,
}

/// An in-process coordination service.
///
/// Behaves like a single ZooKeeper server for the subset the directory uses:
/// data watches are armed by reads, consumed by data-change and deletion
/// events, and survive session-state notifications. Used by tests and by the
/// binary's standalone mode.
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    namespace: Arc<Mutex<Namespace>>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or overwrites a node. Overwriting fires `NodeDataChanged`.
    pub fn set(&self, path: &str, data: impl Into<Vec<u8>>) {
        let existed = {
            let mut ns = self.lock();
            ns.nodes.insert(path.to_string(), data.into()).is_some()
        };
        if existed {
            self.fire(path, WatchEventKind::NodeDataChanged);
        }
    }

    /// Removes a node, firing `NodeDeleted`. Returns false if it did not exist.
    pub fn delete(&self, path: &str) -> bool {
        let existed = self.lock().nodes.remove(path).is_some();
        if existed {
            self.fire(path, WatchEventKind::NodeDeleted);
        }
        existed
    }

    /// Delivers an event to every watch armed on `path`.
    ///
    /// Terminal kinds disarm the watches; others leave them armed.
    /// Returns the number of subscribers that received the event.
    pub fn fire(&self, path: &str, kind: WatchEventKind) -> usize {
        self.fire_event(path, WatchEvent::node(kind, path))
    }

    /// Delivers an arbitrary event to the watches armed on `watched_path`.
    ///
    /// The event's own path may differ from `watched_path`.
    pub fn fire_event(&self, watched_path: &str, event: WatchEvent) -> usize {
        let notifiers = {
            let mut ns = self.lock();
            if event.kind.is_terminal() {
                ns.watches.remove(watched_path).unwrap_or_default()
            } else {
                ns.watches.get(watched_path).cloned().unwrap_or_default()
            }
        };
        notifiers
            .iter()
            .filter(|notifier| notifier.notify(event.clone()))
            .count()
    }

    /// Simulates session expiry: every watch gets an `Expired` event and is dropped.
    pub fn expire_session(&self) {
        let watches = std::mem::take(&mut self.lock().watches);
        for (path, notifiers) in watches {
            for notifier in notifiers {
                notifier.notify(WatchEvent::session(SessionState::Expired, path.clone()));
            }
        }
    }

    /// Makes every subsequent read fail with `error` until cleared with `None`.
    pub fn inject_error(&self, error: Option<CoordinationError>) {
        self.lock().injected_error = error;
    }

    /// Delays every read, widening race windows in tests.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.lock().fetch_delay = delay;
    }

    /// Number of reads issued so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of watches on `path` whose subscriber is still alive.
    pub fn live_watches(&self, path: &str) -> usize {
        self.lock()
            .watches
            .get(path)
            .map(|notifiers| notifiers.iter().filter(|n| !n.is_closed()).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Namespace> {
        // a poisoned namespace is still structurally valid
        self.namespace
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn get_data_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, Subscription), CoordinationError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = self.lock().fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut ns = self.lock();
        if let Some(err) = ns.injected_error.clone() {
            return Err(err);
        }
        let data = ns
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;

        let (notifier, subscription) = Subscription::channel();
        let watches = ns.watches.entry(path.to_string()).or_default();
        watches.retain(|n| !n.is_closed());
        watches.push(notifier);
        Ok((data, subscription))
    }

    async fn close(&self) {
        self.lock().watches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_arms_one_shot_watch() {
        let zk = MemoryCoordinator::new();
        zk.set("/root/t", "v1");

        let (data, mut sub) = zk.get_data_and_watch("/root/t").await.unwrap();
        assert_eq!(data, b"v1");
        assert_eq!(zk.live_watches("/root/t"), 1);

        zk.set("/root/t", "v2");
        let event = sub.next().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::NodeDataChanged);
        assert_eq!(zk.live_watches("/root/t"), 0);

        // a second change is not delivered on a consumed watch
        zk.set("/root/t", "v3");
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_node_and_injected_errors() {
        let zk = MemoryCoordinator::new();
        let err = zk.get_data_and_watch("/root/none").await.unwrap_err();
        assert_eq!(err, CoordinationError::NoNode("/root/none".into()));

        zk.set("/root/t", "{}");
        zk.inject_error(Some(CoordinationError::Connection("down".into())));
        assert!(matches!(
            zk.get_data_and_watch("/root/t").await,
            Err(CoordinationError::Connection(_))
        ));
        zk.inject_error(None);
        assert!(zk.get_data_and_watch("/root/t").await.is_ok());
        assert_eq!(zk.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_non_terminal_events_keep_watch_armed() {
        let zk = MemoryCoordinator::new();
        zk.set("/root/t", "v1");
        let (_, mut sub) = zk.get_data_and_watch("/root/t").await.unwrap();

        assert_eq!(zk.fire("/root/t", WatchEventKind::NodeChildrenChanged), 1);
        assert_eq!(
            sub.next().await.unwrap().kind,
            WatchEventKind::NodeChildrenChanged
        );
        assert_eq!(zk.live_watches("/root/t"), 1);

        assert!(zk.delete("/root/t"));
        assert_eq!(sub.next().await.unwrap().kind, WatchEventKind::NodeDeleted);
    }

    #[tokio::test]
    async fn test_expire_session_drops_watches() {
        let zk = MemoryCoordinator::new();
        zk.set("/root/t", "v1");
        let (_, mut sub) = zk.get_data_and_watch("/root/t").await.unwrap();

        zk.expire_session();
        let event = sub.next().await.unwrap();
        assert_eq!(event.state, SessionState::Expired);
        assert!(sub.next().await.is_none());
    }
}
