use super::pool::MetaConnector;
use crate::core::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Resolution result for one table, as stored in the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_name: String,
    pub cluster_name: String,
    /// Normalized address set (sorted, comma-joined).
    pub meta_addrs: String,
}

/// Node payload under `<root>/<table>`.
#[derive(Debug, Deserialize)]
struct ClusterInfo {
    cluster_name: String,
    meta_addrs: String,
}

pub(crate) fn parse_cluster_info(table: &str, path: &str, data: &[u8]) -> Result<(String, String)> {
    let info: ClusterInfo = serde_json::from_slice(data).map_err(|e| {
        ProxyError::InvalidData(format!(
            "table[{}] info on zk[{}] format is invalid: {}",
            table, path, e
        ))
    })?;
    Ok((info.cluster_name, info.meta_addrs))
}

/// `<root>/<table>`; a root of `/` yields `/<table>`.
pub fn table_path(root: &str, table: &str) -> String {
    if root == "/" {
        format!("/{}", table)
    } else {
        format!("{}/{}", root, table)
    }
}

/// A table name must map onto a single node directly under the root.
pub fn validate_table_name(table: &str) -> Result<()> {
    if table.is_empty() || table.contains('/') {
        return Err(ProxyError::InvalidData(format!(
            "table name [{}] is not a valid node name",
            table
        )));
    }
    Ok(())
}

/// Extracts the table name from a namespace path.
///
/// The path must be a direct child of `root`.
pub fn parse_table_name(root: &str, path: &str) -> std::result::Result<String, String> {
    let prefix = if root == "/" {
        "/".to_string()
    } else {
        format!("{}/", root)
    };
    match path.strip_prefix(&prefix) {
        Some(name) if !name.is_empty() && !name.contains('/') => Ok(name.to_string()),
        _ => Err(format!("path[{}] is not a table node under [{}]", path, root)),
    }
}

/// Cancellation side of a table's watch task.
///
/// Cancels at most once, either explicitly or on drop.
#[derive(Debug)]
pub(crate) struct WatchHandle {
    cancel: Option<oneshot::Sender<()>>,
}

impl WatchHandle {
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { cancel: Some(tx) }, rx)
    }

    /// Returns true the first time it is called.
    pub(crate) fn cancel(&mut self) -> bool {
        match self.cancel.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub(crate) struct TableEntry {
    /// Generation number; a watch task only mutates the entry it was spawned for.
    pub(crate) id: u64,
    pub(crate) info: TableInfo,
    pub(crate) connector: Arc<MetaConnector>,
    pub(crate) watch: WatchHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_path_and_back() {
        let path = table_path("/pegasus-cluster", "tbl1");
        assert_eq!(path, "/pegasus-cluster/tbl1");
        assert_eq!(parse_table_name("/pegasus-cluster", &path).unwrap(), "tbl1");

        assert_eq!(table_path("/", "tbl1"), "/tbl1");
        assert_eq!(parse_table_name("/", "/tbl1").unwrap(), "tbl1");
    }

    #[test]
    fn test_parse_table_name_rejects_foreign_paths() {
        assert!(parse_table_name("/root", "/other/tbl1").is_err());
        assert!(parse_table_name("/root", "/root/").is_err());
        assert!(parse_table_name("/root", "/root/a/b").is_err());
        assert!(parse_table_name("/root", "").is_err());
    }

    #[test]
    fn test_table_names_are_single_nodes() {
        assert!(validate_table_name("tbl1").is_ok());
        assert!(matches!(validate_table_name(""), Err(ProxyError::InvalidData(_))));
        assert!(matches!(validate_table_name("a/b"), Err(ProxyError::InvalidData(_))));
        assert!(matches!(validate_table_name("/tbl1"), Err(ProxyError::InvalidData(_))));
    }

    #[test]
    fn test_parse_cluster_info() {
        let (name, addrs) = parse_cluster_info(
            "t",
            "/r/t",
            br#"{"cluster_name":"c1","meta_addrs":"a:1,b:2"}"#,
        )
        .unwrap();
        assert_eq!(name, "c1");
        assert_eq!(addrs, "a:1,b:2");

        assert!(matches!(
            parse_cluster_info("t", "/r/t", b"{not json"),
            Err(ProxyError::InvalidData(_))
        ));
        assert!(matches!(
            parse_cluster_info("t", "/r/t", br#"{"cluster_name":"c1"}"#),
            Err(ProxyError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_handle_cancels_once() {
        let (mut handle, rx) = WatchHandle::new();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_handle_cancels_on_drop() {
        let (handle, rx) = WatchHandle::new();
        drop(handle);
        assert!(rx.await.is_ok());
    }
}
