use super::body::{RpcBody, downcast_body};
use super::context::CallContext;
use crate::core::{ProxyError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Creates an empty typed-arguments instance for decoding into.
pub type RequestCreator = Arc<dyn Fn() -> Box<dyn RpcBody> + Send + Sync>;

pub type HandlerResult = Result<Box<dyn RpcBody>>;

pub type RpcHandler =
    Arc<dyn Fn(CallContext, Box<dyn RpcBody>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Request constructor and handler registered under one RPC name.
#[derive(Clone)]
pub struct MethodDefinition {
    pub request_creator: RequestCreator,
    pub handler: RpcHandler,
}

impl MethodDefinition {
    pub fn new(request_creator: RequestCreator, handler: RpcHandler) -> Self {
        Self {
            request_creator,
            handler,
        }
    }

    /// Builds a definition from a handler over concrete request/response types.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let def = MethodDefinition::typed(|_ctx, req: QueryCfgRequest| async move {
    ///     Ok(QueryCfgResponse::default())
    /// });
    /// registry.register("RPC_CM_QUERY_PARTITION_CONFIG_BY_INDEX", def);
    /// ```
    pub fn typed<Req, Resp, F, Fut>(handler: F) -> Self
    where
        Req: RpcBody + Default,
        Resp: RpcBody,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self {
            request_creator: Arc::new(|| Box::new(Req::default()) as Box<dyn RpcBody>),
            handler: Arc::new(move |ctx: CallContext, args: Box<dyn RpcBody>| {
                let handler = Arc::clone(&handler);
                async move {
                    let args = downcast_body::<Req>(args)?;
                    let response = (*handler)(ctx, *args).await?;
                    Ok(Box::new(response) as Box<dyn RpcBody>)
                }
                .boxed()
            }),
        }
    }

    pub fn create_request(&self) -> Box<dyn RpcBody> {
        (self.request_creator)()
    }
}

/// RPC name → method definition.
///
/// Filled during startup, then frozen behind an `Arc` and only read while
/// serving.
#[derive(Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<MethodDefinition>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `definition` under `name`, replacing any earlier registration.
    pub fn register(&mut self, name: &str, definition: MethodDefinition) {
        if self
            .methods
            .insert(name.to_string(), Arc::new(definition))
            .is_some()
        {
            warn!(method = name, "rpc method registered twice, keeping the latest");
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<MethodDefinition>> {
        self.methods
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::MethodNotFound(name.to_string()))
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
