use super::codec::{DecodeError, DecodedRequest, DecodedResponse, RequestDecoder, ResponseEncoder};
use super::context::{CallContext, CancelSource};
use super::registry::MethodRegistry;
use crate::core::{ErrorCode, ProxyError, Result};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;

#[derive(Default)]
pub struct ServerMetrics {
    connections: AtomicU64,
    requests: AtomicU64,
    decode_errors: AtomicU64,
}

impl ServerMetrics {
    fn on_connection(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn on_finished(&self, stats: &ConnectionStats) {
        self.requests.fetch_add(stats.requests, Ordering::Relaxed);
        self.decode_errors.fetch_add(stats.decode_errors, Ordering::Relaxed);
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}

/// Totals for one finished connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Requests handed to a handler.
    pub requests: u64,
    /// Frames answered with an error before reaching a handler.
    pub decode_errors: u64,
}

/// Accepts connections and runs one dispatch loop per connection.
pub struct ProxyServer {
    listen_addr: String,
    registry: Arc<MethodRegistry>,
    metrics: Arc<ServerMetrics>,
}

impl ProxyServer {
    pub fn new(listen_addr: &str, registry: Arc<MethodRegistry>) -> Self {
        Self {
            listen_addr: listen_addr.to_string(),
            registry,
            metrics: Arc::new(ServerMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Binds the configured address and serves until the process ends.
    pub async fn serve(&self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    pub async fn serve_with_shutdown<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serves an already bound listener until `shutdown` resolves.
    ///
    /// Connections in progress keep running after the accept loop stops.
    pub async fn serve_listener<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Meta proxy listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("Meta proxy stops accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (socket, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Accept error: {:?}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            if let Err(e) = socket.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {:?}", addr, e);
            }

            let conn_count = self.metrics.on_connection();
            debug!("Accepted new connection from {:?}", addr);
            if conn_count % 1000 == 0 {
                info!("Meta proxy connections accepted: {}", conn_count);
            }

            let registry = Arc::clone(&self.registry);
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                let stats = serve_connection(socket, &addr.to_string(), registry).await;
                metrics.on_finished(&stats);
            });
        }
    }
}

/// Runs the dispatch loop for one connection until end-of-stream or an
/// unrecoverable decode failure.
///
/// Each decoded request runs on its own task and answers through a shared
/// encoder, so responses may leave out of request order. When the loop ends,
/// outstanding calls see cancellation and are awaited before the writer shuts
/// down.
pub async fn serve_connection<S>(stream: S, peer: &str, registry: Arc<MethodRegistry>) -> ConnectionStats
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut decoder = RequestDecoder::new(reader, registry);
    let encoder = Arc::new(ResponseEncoder::new(writer));
    let cancel = CancelSource::new(peer);
    let mut tasks = JoinSet::new();
    let mut stats = ConnectionStats::default();

    loop {
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!("Call task for {} failed: {:?}", peer, e);
            }
        }

        match decoder.read_request().await {
            Ok(request) => {
                stats.requests += 1;
                tasks.spawn(dispatch(request, cancel.context(), Arc::clone(&encoder)));
            }
            Err(DecodeError::Eof) => {
                debug!("Connection from {} closed", peer);
                break;
            }
            Err(DecodeError::Frame {
                seq_id,
                partition,
                method,
                error,
            }) => {
                stats.decode_errors += 1;
                warn!(
                    "Failed to decode request #{} ({}) from {}: {}",
                    seq_id, method, peer, error
                );
                let response = DecodedResponse::error(seq_id, partition, &method, error.error_code());
                if let Err(e) = encoder.send_response(&response).await {
                    error!("Failed to answer request #{} from {}: {}", seq_id, peer, e);
                    break;
                }
            }
            Err(DecodeError::Stream(e)) => {
                stats.decode_errors += 1;
                error!("Closing connection from {}: {}", peer, e);
                break;
            }
        }
    }

    cancel.cancel();
    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            error!("Call task for {} failed: {:?}", peer, e);
        }
    }
    if let Err(e) = encoder.shutdown().await {
        debug!("Shutdown of connection to {} failed: {}", peer, e);
    }
    stats
}

async fn dispatch<W>(
    request: DecodedRequest,
    ctx: CallContext,
    encoder: Arc<ResponseEncoder<W>>,
) where
    W: AsyncWrite + Unpin,
{
    let DecodedRequest {
        seq_id,
        partition,
        method,
        args,
        handler,
    } = request;
    debug!("Request #{} {} on {}", seq_id, method, partition);

    let response = match handler(ctx, args).await {
        Ok(body) => DecodedResponse::ok(seq_id, partition, &method, body),
        Err(e) => {
            debug!("Request #{} {} failed: {}", seq_id, method, e);
            DecodedResponse::error(seq_id, partition, &method, e.error_code())
        }
    };

    match encoder.send_response(&response).await {
        Ok(()) => {}
        Err(ProxyError::Encode(reason)) => {
            warn!("Failed to encode response #{} ({}): {}", seq_id, method, reason);
            let fallback = DecodedResponse::error(seq_id, partition, &method, ErrorCode::Unknown);
            if let Err(e) = encoder.send_response(&fallback).await {
                debug!("Failed to send response #{}: {}", seq_id, e);
            }
        }
        Err(e) => debug!("Failed to send response #{}: {}", seq_id, e),
    }
}
