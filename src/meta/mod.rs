//! Meta-server RPCs served by the proxy.
//!
//! Each handler routes the request to the meta cluster owning the named table
//! and hands it to a [`MetaForwarder`] for the actual backend exchange.

use crate::core::{PartitionId, ProxyError, Result};
use crate::directory::{ClusterDirectory, MetaConnector};
use crate::rpc::{CallContext, MethodDefinition, MethodRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const RPC_CM_QUERY_PARTITION_CONFIG_BY_INDEX: &str = "RPC_CM_QUERY_PARTITION_CONFIG_BY_INDEX";

/// Partition-configuration query for one table.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCfgRequest {
    pub app_name: String,
    /// Empty means every partition.
    pub partition_indices: Vec<i32>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfiguration {
    pub pid: PartitionId,
    pub ballot: i64,
    pub primary: String,
    pub secondaries: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCfgResponse {
    pub app_id: u32,
    pub partition_count: u32,
    pub is_stateful: bool,
    pub partitions: Vec<PartitionConfiguration>,
}

/// Performs a meta call against the cluster a table was resolved to.
#[async_trait]
pub trait MetaForwarder: Send + Sync {
    async fn query_config(
        &self,
        ctx: CallContext,
        connector: Arc<MetaConnector>,
        request: QueryCfgRequest,
    ) -> Result<QueryCfgResponse>;
}

/// Forwarder that answers every call with `ERR_NOT_IMPLEMENTED`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedForwarder;

#[async_trait]
impl MetaForwarder for UnsupportedForwarder {
    async fn query_config(
        &self,
        _ctx: CallContext,
        connector: Arc<MetaConnector>,
        request: QueryCfgRequest,
    ) -> Result<QueryCfgResponse> {
        Err(ProxyError::NotImplemented(format!(
            "forwarding {} for table[{}] to meta[{}]",
            RPC_CM_QUERY_PARTITION_CONFIG_BY_INDEX,
            request.app_name,
            connector.key()
        )))
    }
}

/// Registers the meta RPCs on `registry`.
pub fn register_meta_methods(
    registry: &mut MethodRegistry,
    directory: ClusterDirectory,
    forwarder: Arc<dyn MetaForwarder>,
) {
    registry.register(
        RPC_CM_QUERY_PARTITION_CONFIG_BY_INDEX,
        MethodDefinition::typed(move |ctx: CallContext, request: QueryCfgRequest| {
            let directory = directory.clone();
            let forwarder = Arc::clone(&forwarder);
            async move {
                if request.app_name.is_empty() {
                    return Err(ProxyError::InvalidData("app_name is empty".into()));
                }
                let connector = directory.resolve(&request.app_name).await?;
                debug!(
                    table = %request.app_name,
                    meta = connector.key(),
                    peer = ctx.peer(),
                    "forwarding partition config query"
                );
                forwarder.query_config(ctx, connector, request).await
            }
        }),
    );
}
