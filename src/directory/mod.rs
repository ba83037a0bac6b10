//! Table → meta cluster directory.
//!
//! Resolution is served from a bounded LRU cache. Misses are fetched from the
//! coordination service under the directory lock (double-checked, so racing
//! callers issue one fetch), and every cached table owns a watch task that
//! keeps its entry fresh until the entry is replaced, deleted or evicted.

pub mod entry;
pub mod pool;

use crate::config::ProxyConfig;
use crate::coordination::{
    CoordinationClient, CoordinationError, Subscription, WatchEventKind, ZooKeeperClient,
};
use crate::core::{ProxyError, Result};
use entry::{
    TableEntry, WatchHandle, parse_cluster_info, parse_table_name, table_path, validate_table_name,
};
use lru::LruCache;
use pool::{MetaPool, parse_meta_addrs};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

pub use entry::TableInfo;
pub use pool::MetaConnector;

/// Directory statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryStats {
    pub cached_tables: usize,
    pub capacity: usize,
    pub backend_connections: usize,
    pub live_watchers: usize,
    pub fetches: usize,
}

impl fmt::Display for DirectoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Directory Stats: {}/{} tables cached, {} watchers, {} backends, {} fetches",
            self.cached_tables,
            self.capacity,
            self.live_watchers,
            self.backend_connections,
            self.fetches
        )
    }
}

struct CacheState {
    tables: LruCache<String, TableEntry>,
    pool: MetaPool,
    closed: bool,
}

/// Freshly fetched namespace entry, not yet installed.
struct Fetched {
    info: TableInfo,
    addrs: Vec<String>,
    subscription: Subscription,
}

struct DirectoryInner {
    coordinator: Arc<dyn CoordinationClient>,
    root: String,
    capacity: usize,
    /// Serializes every mutation, including the fetch that precedes it.
    update_lock: tokio::sync::Mutex<()>,
    /// Internal synchronization of the cache and pool; never held across `.await`.
    state: Mutex<CacheState>,
    next_entry_id: AtomicU64,
    live_watchers: Arc<AtomicUsize>,
    fetches: AtomicUsize,
}

/// Counts a running watch task for its whole lifetime.
struct WatcherGuard(Arc<AtomicUsize>);

impl WatcherGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves table names to the meta cluster that owns them.
///
/// Cheap to clone; all clones share one cache. Constructed once at startup
/// and passed to whatever needs resolution.
///
/// # Examples
///
/// ```ignore
/// let directory = ClusterDirectory::open(&config).await?;
/// let connector = directory.resolve("tbl1").await?;
/// println!("tbl1 lives on {}", connector.key());
/// directory.close().await;
/// ```
#[derive(Clone)]
pub struct ClusterDirectory {
    inner: Arc<DirectoryInner>,
}

impl ClusterDirectory {
    /// Connects to the configured ZooKeeper ensemble and opens a directory on it.
    pub async fn open(config: &ProxyConfig) -> Result<Self> {
        let zk = ZooKeeperClient::connect(config.zk_addrs.clone(), config.zk_timeout_duration())
            .await
            .map_err(|e| {
                ProxyError::CoordinationService(format!(
                    "connect to {:?} failed: {}",
                    config.zk_addrs, e
                ))
            })?;
        Self::with_coordinator(
            Arc::new(zk),
            config.normalized_root(),
            config.max_watched_tables,
        )
    }

    /// Opens a directory over an existing coordination client.
    pub fn with_coordinator(
        coordinator: Arc<dyn CoordinationClient>,
        root: &str,
        capacity: usize,
    ) -> Result<Self> {
        let cap = NonZeroUsize::new(capacity)
            .ok_or_else(|| ProxyError::Config("directory capacity must be > 0".into()))?;
        let root = match root.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };

        Ok(Self {
            inner: Arc::new(DirectoryInner {
                coordinator,
                root,
                capacity,
                update_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(CacheState {
                    tables: LruCache::new(cap),
                    pool: MetaPool::new(),
                    closed: false,
                }),
                next_entry_id: AtomicU64::new(1),
                live_watchers: Arc::new(AtomicUsize::new(0)),
                fetches: AtomicUsize::new(0),
            }),
        })
    }

    /// Resolves `table` to the connector of the meta cluster that owns it.
    pub async fn resolve(&self, table: &str) -> Result<Arc<MetaConnector>> {
        self.resolve_entry(table).await.map(|(_, connector)| connector)
    }

    /// Like [`resolve`](Self::resolve) but returns the cached cluster info.
    pub async fn resolve_table(&self, table: &str) -> Result<TableInfo> {
        self.resolve_entry(table).await.map(|(info, _)| info)
    }

    async fn resolve_entry(&self, table: &str) -> Result<(TableInfo, Arc<MetaConnector>)> {
        validate_table_name(table)?;
        if let Some(hit) = self.inner.lookup(table)? {
            return Ok(hit);
        }

        debug!(table, "can't get cluster info from local cache, fetching from zk");
        let _guard = self.inner.update_lock.lock().await;
        if let Some(hit) = self.inner.lookup(table)? {
            return Ok(hit);
        }

        let fetched = self.inner.fetch(table).await.inspect_err(|err| {
            error!(table, %err, "get table info failed");
        })?;
        DirectoryInner::install(&self.inner, table, fetched)
    }

    /// Whether `table` is cached; does not touch recency.
    pub fn is_cached(&self, table: &str) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.tables.contains(table))
            .unwrap_or(false)
    }

    pub fn root(&self) -> &str {
        &self.inner.root
    }

    pub fn stats(&self) -> DirectoryStats {
        let (cached_tables, backend_connections) = match self.inner.state.lock() {
            Ok(state) => (state.tables.len(), state.pool.len()),
            Err(_) => (0, 0),
        };
        DirectoryStats {
            cached_tables,
            capacity: self.inner.capacity,
            backend_connections,
            live_watchers: self.inner.live_watchers.load(Ordering::SeqCst),
            fetches: self.inner.fetches.load(Ordering::SeqCst),
        }
    }

    /// Cancels every watch, empties the cache and closes the coordination client.
    ///
    /// Subsequent resolutions fail with `DirectoryClosed`.
    pub async fn close(&self) {
        {
            let _guard = self.inner.update_lock.lock().await;
            match self.inner.state.lock() {
                Ok(mut state) => {
                    state.closed = true;
                    while let Some((_, mut entry)) = state.tables.pop_lru() {
                        entry.watch.cancel();
                    }
                }
                Err(err) => error!(%err, "directory state poisoned during close"),
            }
        }
        self.inner.coordinator.close().await;
        info!("cluster directory closed");
    }
}

impl DirectoryInner {
    fn lookup(&self, table: &str) -> Result<Option<(TableInfo, Arc<MetaConnector>)>> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Err(ProxyError::DirectoryClosed);
        }
        Ok(state
            .tables
            .get(table)
            .map(|entry| (entry.info.clone(), Arc::clone(&entry.connector))))
    }

    /// Reads `<root>/<table>` and arms a watch on it. Caller holds `update_lock`.
    async fn fetch(&self, table: &str) -> Result<Fetched> {
        let path = table_path(&self.root, table);
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let (data, subscription) = self
            .coordinator
            .get_data_and_watch(&path)
            .await
            .map_err(|err| match err {
                CoordinationError::NoNode(_) => ProxyError::ObjectNotFound(format!(
                    "the table[{}] info doesn't exist on zk[{}]",
                    table, path
                )),
                other => ProxyError::CoordinationService(format!(
                    "get table[{}] info from zk[{}] failed: {}",
                    table, path, other
                )),
            })?;

        let (cluster_name, raw_addrs) = parse_cluster_info(table, &path, &data)?;
        let addrs = parse_meta_addrs(&raw_addrs)?;

        Ok(Fetched {
            info: TableInfo {
                table_name: table.to_string(),
                cluster_name,
                meta_addrs: addrs.join(","),
            },
            addrs,
            subscription,
        })
    }

    /// Inserts (or replaces) the entry for `table` and starts its watch task.
    ///
    /// Caller holds `update_lock`. Eviction happens inside the same critical
    /// section, and the evicted entry's watch is canceled before returning.
    fn install(
        this: &Arc<Self>,
        table: &str,
        fetched: Fetched,
    ) -> Result<(TableInfo, Arc<MetaConnector>)> {
        let mut state = this.state.lock()?;
        if state.closed {
            return Err(ProxyError::DirectoryClosed);
        }

        let connector = state.pool.get_or_create(fetched.addrs);
        let id = this.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let (watch, cancel_rx) = WatchHandle::new();
        let info = fetched.info;

        let evicted = state.tables.push(
            table.to_string(),
            TableEntry {
                id,
                info: info.clone(),
                connector: Arc::clone(&connector),
                watch,
            },
        );
        if let Some((key, mut old)) = evicted {
            old.watch.cancel();
            if key != table {
                warn!(
                    capacity = this.capacity,
                    evicted = %key,
                    "table cache is full, removed the least recently used table"
                );
            }
        }

        let guard = WatcherGuard::new(&this.live_watchers);
        tokio::spawn(watch_table(
            Arc::downgrade(this),
            table.to_string(),
            id,
            fetched.subscription,
            cancel_rx,
            guard,
        ));

        Ok((info, connector))
    }

    /// Whether the live entry for `table` is still generation `id`.
    fn owns(&self, table: &str, id: u64) -> bool {
        self.state
            .lock()
            .map(|state| !state.closed && state.tables.peek(table).map(|e| e.id) == Some(id))
            .unwrap_or(false)
    }

    /// Removes generation `id` of `table` and cancels its watch.
    fn remove(&self, table: &str, id: u64) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.tables.peek(table).map(|e| e.id) != Some(id) {
            return false;
        }
        match state.tables.pop(table) {
            Some(mut entry) => {
                entry.watch.cancel();
                true
            }
            None => false,
        }
    }

    /// Handles a data change: re-fetch (re-arming the watch) and replace in place.
    async fn refresh(this: &Arc<Self>, table: &str, id: u64) {
        let _guard = this.update_lock.lock().await;
        if !this.owns(table, id) {
            debug!(table, "entry changed before refresh, dropping stale watch");
            return;
        }

        let result = match this.fetch(table).await {
            Ok(fetched) => Self::install(this, table, fetched),
            Err(err) => Err(err),
        };
        match result {
            Ok((info, _)) => info!(
                table,
                cluster = %info.cluster_name,
                meta_addrs = %info.meta_addrs,
                "cluster info is updated"
            ),
            Err(err) => {
                warn!(table, %err, "get cluster info failed when watch fired, dropping cache entry");
                this.remove(table, id);
            }
        }
    }

    async fn forget(&self, table: &str, id: u64, reason: &str) {
        let _guard = self.update_lock.lock().await;
        if self.remove(table, id) {
            info!(table, reason, "cluster info is removed from local cache");
        }
    }
}

/// Watch task owned by one cache entry.
async fn watch_table(
    directory: Weak<DirectoryInner>,
    table: String,
    id: u64,
    mut subscription: Subscription,
    mut cancel: oneshot::Receiver<()>,
    _guard: WatcherGuard,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut cancel => {
                debug!(table = %table, "table watcher is canceled from cache");
                return;
            }
            event = subscription.next() => event,
        };
        let Some(directory) = directory.upgrade() else {
            return;
        };

        let Some(event) = event else {
            directory
                .forget(&table, id, "watch dropped by coordination service")
                .await;
            return;
        };

        if event.kind != WatchEventKind::None {
            match parse_table_name(&directory.root, &event.path) {
                Ok(name) if name == table => {}
                Ok(name) => fatal_namespace_corruption(&event.path, &format!(
                    "event for table[{}] delivered to watcher of table[{}]",
                    name, table
                )),
                Err(reason) => fatal_namespace_corruption(&event.path, &reason),
            }
        }

        match event.kind {
            WatchEventKind::NodeDataChanged => {
                DirectoryInner::refresh(&directory, &table, id).await;
                return;
            }
            WatchEventKind::NodeDeleted => {
                info!(table = %table, "cluster info is removed from zk");
                directory.forget(&table, id, "node deleted").await;
                return;
            }
            kind => {
                info!(table = %table, %kind, state = ?event.state, "cluster info watch event ignored");
            }
        }
    }
}

/// The namespace no longer matches `<root>/<table>`; continuing would route
/// requests on data the directory cannot interpret.
fn fatal_namespace_corruption(path: &str, reason: &str) -> ! {
    error!(path, reason, "zk path is corrupt, unable to parse table name");
    std::process::abort();
}
