use crate::core::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Proxy configuration
///
/// Loaded once at startup, either from defaults, a JSON file, or both
/// (CLI flags are applied on top by the binary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the RPC listener binds to
    pub listen_addr: String,

    /// Coordination service endpoints (`host:port`)
    pub zk_addrs: Vec<String>,

    /// Session / connection-establishment timeout for the coordination service
    pub zk_timeout_ms: u64,

    /// Namespace root holding one node per table
    pub zk_root: String,

    /// Maximum number of concurrently cached (and watched) tables
    pub max_watched_tables: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:34601".to_string(),
            zk_addrs: Vec::new(),
            zk_timeout_ms: 1000,
            zk_root: "/pegasus-cluster".to_string(),
            max_watched_tables: 1024,
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address
    pub fn listen_addr(mut self, addr: &str) -> Self {
        self.listen_addr = addr.to_string();
        self
    }

    /// Set the coordination service endpoints
    pub fn zk_addrs<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.zk_addrs = addrs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the coordination service timeout
    pub fn zk_timeout(mut self, timeout: Duration) -> Self {
        self.zk_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the namespace root
    pub fn zk_root(mut self, root: &str) -> Self {
        self.zk_root = root.to_string();
        self
    }

    /// Set the table cache capacity
    pub fn max_watched_tables(mut self, max: usize) -> Self {
        self.max_watched_tables = max;
        self
    }

    pub fn zk_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.zk_timeout_ms)
    }

    /// Namespace root without a trailing slash.
    pub fn normalized_root(&self) -> &str {
        let trimmed = self.zk_root.trim_end_matches('/');
        if trimmed.is_empty() { "/" } else { trimmed }
    }

    /// Load configuration from a JSON file. Missing fields take their defaults.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = ProxyConfig::from_file("meta-proxy.json")?;
    /// ```
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ProxyError::Config(format!("failed to parse '{}': {}", path.display(), e))
        })
    }

    /// Validate configuration
    ///
    /// `standalone` skips the coordination endpoint check (in-process namespace).
    pub fn validate(&self, standalone: bool) -> std::result::Result<(), String> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(format!("listen_addr '{}' is not a socket address", self.listen_addr));
        }

        if !standalone && self.zk_addrs.iter().all(|a| a.trim().is_empty()) {
            return Err("zk_addrs must contain at least one endpoint".to_string());
        }

        if self.zk_timeout_ms == 0 {
            return Err("zk_timeout_ms must be > 0".to_string());
        }

        if !self.zk_root.starts_with('/') {
            return Err(format!("zk_root '{}' must be an absolute path", self.zk_root));
        }

        if self.max_watched_tables == 0 {
            return Err("max_watched_tables must be > 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid_for_standalone() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:34601");
        assert_eq!(config.zk_root, "/pegasus-cluster");
        assert_eq!(config.max_watched_tables, 1024);
        assert!(config.validate(true).is_ok());
        assert!(config.validate(false).is_err());
    }

    #[test]
    fn test_builder_and_validation() {
        let config = ProxyConfig::new()
            .zk_addrs(["127.0.0.1:2181"])
            .zk_timeout(Duration::from_secs(3))
            .max_watched_tables(0);
        assert_eq!(config.zk_timeout_duration(), Duration::from_secs(3));
        assert!(config.validate(false).unwrap_err().contains("max_watched_tables"));

        let config = ProxyConfig::new().zk_root("relative");
        assert!(config.validate(true).unwrap_err().contains("absolute"));

        let config = ProxyConfig::new().listen_addr("not-an-addr");
        assert!(config.validate(true).is_err());
    }

    #[test]
    fn test_normalized_root() {
        assert_eq!(ProxyConfig::new().zk_root("/a/b/").normalized_root(), "/a/b");
        assert_eq!(ProxyConfig::new().zk_root("/").normalized_root(), "/");
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"zk_addrs": ["10.0.0.9:2181"], "max_watched_tables": 16}}"#
        )
        .unwrap();

        let config = ProxyConfig::from_file(file.path()).unwrap();
        assert_eq!(config.zk_addrs, vec!["10.0.0.9:2181".to_string()]);
        assert_eq!(config.max_watched_tables, 16);
        assert_eq!(config.zk_timeout_ms, 1000);
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = ProxyConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }
}
