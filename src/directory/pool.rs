use crate::core::{ProxyError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Handle to one backend cluster's meta servers.
///
/// Shared by every table routed to the same address set; compare with
/// `Arc::ptr_eq` for identity.
pub struct MetaConnector {
    key: String,
    addrs: Vec<String>,
    created_at: Instant,
}

impl MetaConnector {
    fn new(addrs: Vec<String>) -> Self {
        Self {
            key: addrs.join(","),
            addrs,
            created_at: Instant::now(),
        }
    }

    /// Normalized address set, also the pool key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl fmt::Debug for MetaConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaConnector")
            .field("addrs", &self.addrs)
            .finish()
    }
}

/// Parses a comma-separated endpoint list into its normalized form.
///
/// Endpoints are trimmed, sorted and de-duplicated; an empty endpoint or fewer
/// than two distinct endpoints is `InvalidData`.
pub fn parse_meta_addrs(raw: &str) -> Result<Vec<String>> {
    let mut addrs = Vec::new();
    for part in raw.split(',') {
        let addr = part.trim();
        if addr.is_empty() {
            return Err(ProxyError::InvalidData(format!(
                "the meta addrs[{}] contains an empty endpoint",
                raw
            )));
        }
        addrs.push(addr.to_string());
    }
    addrs.sort();
    addrs.dedup();

    if addrs.len() < 2 {
        return Err(ProxyError::InvalidData(format!(
            "the meta addrs[{}] is invalid: need at least 2 endpoints",
            raw
        )));
    }
    Ok(addrs)
}

/// Backend connector pool keyed by normalized address set.
///
/// Entries live for the process lifetime.
#[derive(Default)]
pub struct MetaPool {
    connectors: HashMap<String, Arc<MetaConnector>>,
}

impl MetaPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connector for `addrs`, creating it on first use.
    pub fn get_or_create(&mut self, addrs: Vec<String>) -> Arc<MetaConnector> {
        let key = addrs.join(",");
        Arc::clone(
            self.connectors
                .entry(key)
                .or_insert_with(|| Arc::new(MetaConnector::new(addrs))),
        )
    }

    pub fn get(&self, key: &str) -> Option<Arc<MetaConnector>> {
        self.connectors.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_addrs_normalizes() {
        let addrs = parse_meta_addrs(" 10.0.0.2:34601,10.0.0.1:34601 ").unwrap();
        assert_eq!(addrs, vec!["10.0.0.1:34601", "10.0.0.2:34601"]);
    }

    #[test]
    fn test_parse_meta_addrs_rejects_short_lists() {
        assert!(matches!(
            parse_meta_addrs("10.0.0.1:34601"),
            Err(ProxyError::InvalidData(_))
        ));
        assert!(matches!(
            parse_meta_addrs("10.0.0.1:34601,10.0.0.1:34601"),
            Err(ProxyError::InvalidData(_))
        ));
        assert!(matches!(
            parse_meta_addrs("10.0.0.1:34601,,10.0.0.2:34601"),
            Err(ProxyError::InvalidData(_))
        ));
        assert!(parse_meta_addrs("").is_err());
    }

    #[test]
    fn test_pool_reuses_identical_address_sets() {
        let mut pool = MetaPool::new();
        let a = pool.get_or_create(parse_meta_addrs("h1:1,h2:2").unwrap());
        let b = pool.get_or_create(parse_meta_addrs("h2:2,h1:1").unwrap());
        let c = pool.get_or_create(parse_meta_addrs("h1:1,h3:3").unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.key(), "h1:1,h2:2");
        assert_eq!(pool.len(), 2);
        assert!(pool.get("h1:1,h3:3").is_some());
    }
}
