// ============================================================================
// Meta Proxy Library
// ============================================================================

pub mod config;
pub mod coordination;
pub mod core;
pub mod directory;
pub mod meta;
pub mod rpc;

pub use config::ProxyConfig;
pub use coordination::{CoordinationClient, MemoryCoordinator, ZooKeeperClient};
pub use core::{ErrorCode, PartitionId, ProxyError, Result};
pub use directory::{ClusterDirectory, DirectoryStats, MetaConnector, TableInfo};
pub use meta::{MetaForwarder, UnsupportedForwarder, register_meta_methods};
pub use rpc::{MethodDefinition, MethodRegistry, ProxyServer};
