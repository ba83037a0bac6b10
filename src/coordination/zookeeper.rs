//! Minimal ZooKeeper client.
//!
//! Speaks just enough of the jute protocol for the directory: session
//! handshake, `getData` with a watch, pings, and watch notifications. A lost
//! connection fails every pending request, disarms every watch (subscribers
//! get a `Disconnected` event and then a closed channel) and is re-established
//! lazily by the next request.

use super::{
    CoordinationClient, CoordinationError, SessionState, Subscription, WatchEvent, WatchEventKind,
    WatchNotifier,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

type Transport = Framed<TcpStream, LengthDelimitedCodec>;

pub(crate) mod proto {
    use super::CoordinationError;
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use tokio_util::codec::LengthDelimitedCodec;

    pub const OP_GET_DATA: i32 = 4;
    pub const OP_PING: i32 = 11;
    pub const OP_CLOSE_SESSION: i32 = -11;

    pub const XID_NOTIFICATION: i32 = -1;
    pub const XID_PING: i32 = -2;

    pub const ERR_OK: i32 = 0;
    pub const ERR_NO_NODE: i32 = -101;

    pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    /// Packets are prefixed with a 4-byte big-endian length.
    pub fn frame_codec() -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec()
    }

    /// Jute record writer.
    #[derive(Default)]
    pub struct Writer {
        buf: BytesMut,
    }

    impl Writer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn i32(mut self, v: i32) -> Self {
            self.buf.put_i32(v);
            self
        }

        pub fn i64(mut self, v: i64) -> Self {
            self.buf.put_i64(v);
            self
        }

        pub fn bool(mut self, v: bool) -> Self {
            self.buf.put_u8(u8::from(v));
            self
        }

        pub fn buffer(mut self, v: &[u8]) -> Self {
            self.buf.put_i32(v.len() as i32);
            self.buf.put_slice(v);
            self
        }

        pub fn string(self, v: &str) -> Self {
            self.buffer(v.as_bytes())
        }

        pub fn into_bytes(self) -> Bytes {
            self.buf.freeze()
        }
    }

    /// Cursor over one received packet (length prefix already stripped).
    pub struct Reader {
        buf: Bytes,
    }

    impl Reader {
        pub fn new(buf: impl Into<Bytes>) -> Self {
            Self { buf: buf.into() }
        }

        fn need(&self, n: usize) -> Result<(), CoordinationError> {
            if self.buf.remaining() < n {
                return Err(CoordinationError::Protocol(format!(
                    "record truncated: need {} bytes, have {}",
                    n,
                    self.buf.remaining()
                )));
            }
            Ok(())
        }

        pub fn i32(&mut self) -> Result<i32, CoordinationError> {
            self.need(4)?;
            Ok(self.buf.get_i32())
        }

        pub fn i64(&mut self) -> Result<i64, CoordinationError> {
            self.need(8)?;
            Ok(self.buf.get_i64())
        }

        /// `None` for a null buffer (length -1).
        pub fn buffer(&mut self) -> Result<Option<Bytes>, CoordinationError> {
            let len = self.i32()?;
            if len < 0 {
                return Ok(None);
            }
            self.need(len as usize)?;
            Ok(Some(self.buf.split_to(len as usize)))
        }

        pub fn string(&mut self) -> Result<String, CoordinationError> {
            let raw = self.buffer()?.unwrap_or_default();
            String::from_utf8(raw.to_vec())
                .map_err(|e| CoordinationError::Protocol(format!("invalid utf-8 string: {}", e)))
        }

        /// Unread remainder of the packet.
        pub fn into_rest(self) -> Bytes {
            self.buf
        }
    }

    pub fn connect_request(session_timeout_ms: i32) -> Bytes {
        Writer::new()
            .i32(0) // protocol version
            .i64(0) // last zxid seen
            .i32(session_timeout_ms)
            .i64(0) // session id
            .buffer(&[0u8; 16])
            .bool(false) // read-only
            .into_bytes()
    }

    #[derive(Debug, PartialEq, Eq)]
    pub struct ConnectResponse {
        pub session_timeout_ms: i32,
        pub session_id: i64,
    }

    pub fn parse_connect_response(
        packet: impl Into<Bytes>,
    ) -> Result<ConnectResponse, CoordinationError> {
        let mut r = Reader::new(packet);
        let _protocol_version = r.i32()?;
        let session_timeout_ms = r.i32()?;
        let session_id = r.i64()?;
        let _passwd = r.buffer()?;
        Ok(ConnectResponse {
            session_timeout_ms,
            session_id,
        })
    }

    pub fn get_data_request(xid: i32, path: &str, watch: bool) -> Bytes {
        Writer::new()
            .i32(xid)
            .i32(OP_GET_DATA)
            .string(path)
            .bool(watch)
            .into_bytes()
    }

    pub fn ping_request() -> Bytes {
        Writer::new().i32(XID_PING).i32(OP_PING).into_bytes()
    }

    pub fn close_session_request(xid: i32) -> Bytes {
        Writer::new().i32(xid).i32(OP_CLOSE_SESSION).into_bytes()
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReplyHeader {
        pub xid: i32,
        pub zxid: i64,
        pub err: i32,
    }

    pub fn parse_reply_header(r: &mut Reader) -> Result<ReplyHeader, CoordinationError> {
        Ok(ReplyHeader {
            xid: r.i32()?,
            zxid: r.i64()?,
            err: r.i32()?,
        })
    }

    /// `(type, state, path)` of a watcher notification body.
    pub fn parse_watcher_event(body: Bytes) -> Result<(i32, i32, String), CoordinationError> {
        let mut r = Reader::new(body);
        Ok((r.i32()?, r.i32()?, r.string()?))
    }
}

struct Reply {
    header: proto::ReplyHeader,
    body: Bytes,
}

struct PendingRequest {
    reply: oneshot::Sender<Result<Reply, CoordinationError>>,
    /// Armed by the reader once the reply succeeds, before any later
    /// notification on the same connection is dispatched.
    watch: Option<(String, WatchNotifier)>,
}

#[derive(Default)]
struct SessionInner {
    alive: bool,
    pending: HashMap<i32, PendingRequest>,
    watches: HashMap<String, Vec<WatchNotifier>>,
}

struct SessionShared {
    session_id: i64,
    next_xid: AtomicI32,
    state: Mutex<SessionInner>,
}

impl SessionShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_alive(&self) -> bool {
        self.lock().alive
    }

    fn next_xid(&self) -> i32 {
        // xids below 1 are reserved for notifications, pings and auth
        let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
        if xid <= 0 {
            self.next_xid.store(2, Ordering::SeqCst);
            1
        } else {
            xid
        }
    }

    fn register(&self, xid: i32, pending: PendingRequest) -> Result<(), CoordinationError> {
        let mut state = self.lock();
        if !state.alive {
            return Err(CoordinationError::Connection("session is closed".into()));
        }
        state.pending.insert(xid, pending);
        Ok(())
    }

    fn dispatch_reply(&self, header: proto::ReplyHeader, body: Bytes) {
        let pending = {
            let mut state = self.lock();
            let Some(pending) = state.pending.remove(&header.xid) else {
                warn!(xid = header.xid, "reply for unknown request");
                return;
            };
            if header.err == proto::ERR_OK {
                if let Some((path, notifier)) = &pending.watch {
                    let watches = state.watches.entry(path.clone()).or_default();
                    watches.retain(|n| !n.is_closed());
                    watches.push(notifier.clone());
                }
            }
            pending
        };
        let _ = pending.reply.send(Ok(Reply { header, body }));
    }

    fn dispatch_notification(&self, event: WatchEvent) {
        let notifiers: Vec<WatchNotifier> = {
            let mut state = self.lock();
            match event.kind {
                WatchEventKind::None => state.watches.values().flatten().cloned().collect(),
                kind if kind.is_terminal() => state.watches.remove(&event.path).unwrap_or_default(),
                _ => state.watches.get(&event.path).cloned().unwrap_or_default(),
            }
        };
        debug!(path = %event.path, kind = %event.kind, subscribers = notifiers.len(), "watch notification");
        for notifier in notifiers {
            notifier.notify(event.clone());
        }
    }

    /// Idempotent: fails pending requests and disarms every watch.
    fn teardown(&self, reason: CoordinationError) {
        let (pending, watches) = {
            let mut state = self.lock();
            if !state.alive {
                return;
            }
            state.alive = false;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.watches),
            )
        };
        warn!(session_id = self.session_id, %reason, "zookeeper session lost");
        for (_, request) in pending {
            let _ = request.reply.send(Err(reason.clone()));
        }
        for (path, notifiers) in watches {
            for notifier in notifiers {
                notifier.notify(WatchEvent::session(SessionState::Disconnected, path.clone()));
            }
        }
    }
}

struct Session {
    shared: Arc<SessionShared>,
    outgoing: mpsc::UnboundedSender<Bytes>,
}

impl Session {
    async fn establish(addr: &str, timeout: Duration) -> Result<Session, CoordinationError> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let handshake = async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| CoordinationError::Connection(format!("{}: {}", addr, e)))?;
            stream.set_nodelay(true).ok();
            let mut transport = Transport::new(stream, proto::frame_codec());
            transport.send(proto::connect_request(timeout_ms)).await?;
            let packet = transport.next().await.ok_or_else(|| {
                CoordinationError::Connection(format!("{} closed the connection during handshake", addr))
            })??;
            let response = proto::parse_connect_response(packet)?;
            Ok::<_, CoordinationError>((transport, response))
        };

        let (transport, response) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| {
                CoordinationError::Connection(format!("connect to {} timed out", addr))
            })??;

        if response.session_timeout_ms <= 0 {
            return Err(CoordinationError::Connection(format!(
                "{} refused the session",
                addr
            )));
        }
        info!(
            server = addr,
            session_id = response.session_id,
            timeout_ms = response.session_timeout_ms,
            "zookeeper session established"
        );

        let shared = Arc::new(SessionShared {
            session_id: response.session_id,
            next_xid: AtomicI32::new(1),
            state: Mutex::new(SessionInner {
                alive: true,
                ..Default::default()
            }),
        });
        let (outgoing, requests) = mpsc::unbounded_channel();
        let (sink, packets) = transport.split();
        let ping_interval =
            Duration::from_millis((response.session_timeout_ms as u64 / 3).max(10));

        tokio::spawn(run_reader(packets, Arc::clone(&shared)));
        tokio::spawn(run_writer(
            sink,
            requests,
            ping_interval,
            Arc::clone(&shared),
        ));

        Ok(Session { shared, outgoing })
    }

    fn send(&self, packet: Bytes) -> Result<(), CoordinationError> {
        self.outgoing
            .send(packet)
            .map_err(|_| CoordinationError::Connection("session writer stopped".into()))
    }
}

async fn run_reader(mut packets: SplitStream<Transport>, shared: Arc<SessionShared>) {
    let reason = loop {
        let packet = match packets.next().await {
            Some(Ok(packet)) => packet,
            Some(Err(err)) => break CoordinationError::from(err),
            None => break CoordinationError::Connection("connection closed by server".into()),
        };
        let mut reader = proto::Reader::new(packet);
        let header = match proto::parse_reply_header(&mut reader) {
            Ok(header) => header,
            Err(err) => break err,
        };
        let body = reader.into_rest();
        match header.xid {
            proto::XID_PING => {}
            proto::XID_NOTIFICATION => match proto::parse_watcher_event(body) {
                Ok((kind, state, path)) => match WatchEventKind::from_wire(kind) {
                    Some(kind) => shared.dispatch_notification(WatchEvent {
                        kind,
                        state: SessionState::from_wire(state),
                        path,
                    }),
                    None => warn!(kind, %path, "unknown watch event type"),
                },
                Err(err) => break err,
            },
            _ => shared.dispatch_reply(header, body),
        }
    };
    shared.teardown(reason);
}

async fn run_writer(
    mut sink: SplitSink<Transport, Bytes>,
    mut requests: mpsc::UnboundedReceiver<Bytes>,
    ping_interval: Duration,
    shared: Arc<SessionShared>,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.tick().await;
    loop {
        let packet = tokio::select! {
            request = requests.recv() => match request {
                Some(packet) => packet,
                None => break,
            },
            _ = ticker.tick() => {
                if !shared.is_alive() {
                    break;
                }
                proto::ping_request()
            }
        };
        if let Err(err) = sink.send(packet).await {
            shared.teardown(CoordinationError::from(err));
            break;
        }
    }
    let _ = sink.close().await;
}

/// ZooKeeper-backed [`CoordinationClient`].
pub struct ZooKeeperClient {
    servers: Vec<String>,
    session_timeout: Duration,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
    closed: AtomicBool,
}

impl ZooKeeperClient {
    /// Creates a client without connecting; see [`ZooKeeperClient::connect`].
    pub fn new<I, S>(servers: I, session_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.trim().is_empty())
                .collect(),
            session_timeout,
            session: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a client and establishes the first session eagerly.
    pub async fn connect<I, S>(
        servers: I,
        session_timeout: Duration,
    ) -> Result<Self, CoordinationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new(servers, session_timeout);
        client.session().await?;
        Ok(client)
    }

    async fn session(&self) -> Result<Arc<Session>, CoordinationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.shared.is_alive() {
                return Ok(Arc::clone(session));
            }
        }

        let mut last_err =
            CoordinationError::Connection("no coordination endpoints configured".into());
        for server in &self.servers {
            match Session::establish(server, self.session_timeout).await {
                Ok(session) => {
                    let session = Arc::new(session);
                    *slot = Some(Arc::clone(&session));
                    return Ok(session);
                }
                Err(err) => {
                    warn!(%server, %err, "zookeeper endpoint unavailable");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl CoordinationClient for ZooKeeperClient {
    async fn get_data_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, Subscription), CoordinationError> {
        let session = self.session().await?;
        let xid = session.shared.next_xid();
        let (notifier, subscription) = Subscription::channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        session.shared.register(
            xid,
            PendingRequest {
                reply: reply_tx,
                watch: Some((path.to_string(), notifier)),
            },
        )?;
        session.send(proto::get_data_request(xid, path, true))?;

        let reply = reply_rx
            .await
            .map_err(|_| CoordinationError::Connection("session dropped the request".into()))??;

        match reply.header.err {
            proto::ERR_OK => {
                let data = proto::Reader::new(reply.body).buffer()?.unwrap_or_default();
                Ok((data.to_vec(), subscription))
            }
            proto::ERR_NO_NODE => Err(CoordinationError::NoNode(path.to_string())),
            code => Err(CoordinationError::Server {
                code,
                path: path.to_string(),
            }),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(session) = self.session.lock().await.take() {
            let xid = session.shared.next_xid();
            let _ = session.send(proto::close_session_request(xid));
            session.shared.teardown(CoordinationError::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::proto::*;
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_connect_request_layout() {
        let packet = connect_request(1000);
        // 4 version + 8 zxid + 4 timeout + 8 session + 4+16 passwd + 1 ro
        assert_eq!(packet.len(), 45);
        assert_eq!(&packet[12..16], &1000i32.to_be_bytes());
    }

    #[test]
    fn test_get_data_request_layout() {
        let packet = get_data_request(7, "/r/t", true);
        let mut r = Reader::new(packet.clone());
        assert_eq!(r.i32().unwrap(), 7);
        assert_eq!(r.i32().unwrap(), OP_GET_DATA);
        assert_eq!(r.string().unwrap(), "/r/t");
        assert_eq!(packet.last(), Some(&1u8));
    }

    #[test]
    fn test_reader_rejects_truncated_record() {
        let mut r = Reader::new(Bytes::from_static(&[0, 0, 0, 9, 1, 2]));
        assert!(matches!(r.buffer(), Err(CoordinationError::Protocol(_))));
        let mut r = Reader::new(Bytes::from_static(&[0, 1]));
        assert!(matches!(r.i32(), Err(CoordinationError::Protocol(_))));
    }

    #[test]
    fn test_watcher_event_parsing() {
        let packet = Writer::new()
            .i32(XID_NOTIFICATION)
            .i64(-1)
            .i32(0)
            .i32(3)
            .i32(3)
            .string("/r/t")
            .into_bytes();
        let mut r = Reader::new(packet);
        let header = parse_reply_header(&mut r).unwrap();
        assert_eq!(header.xid, XID_NOTIFICATION);
        let (kind, state, path) = parse_watcher_event(r.into_rest()).unwrap();
        assert_eq!(WatchEventKind::from_wire(kind), Some(WatchEventKind::NodeDataChanged));
        assert_eq!(SessionState::from_wire(state), SessionState::SyncConnected);
        assert_eq!(path, "/r/t");
    }

    fn reply(xid: i32, err: i32) -> Writer {
        Writer::new().i32(xid).i64(1).i32(err)
    }

    fn stat(w: Writer) -> Writer {
        w.i64(0)
            .i64(0)
            .i64(0)
            .i64(0)
            .i32(0)
            .i32(0)
            .i32(0)
            .i64(0)
            .i32(0)
            .i32(0)
            .i64(0)
    }

    /// Single-connection fake server: answers the handshake, serves one node
    /// at `/r/t`, and fires a data-change on it after the first read.
    async fn fake_server(listener: TcpListener) {
        let (socket, _) = listener.accept().await.unwrap();
        let mut transport = Framed::new(socket, frame_codec());
        let _connect = transport.next().await.unwrap().unwrap();
        let response = Writer::new()
            .i32(0)
            .i32(3000)
            .i64(0x1234)
            .buffer(&[0u8; 16])
            .into_bytes();
        transport.send(response).await.unwrap();

        loop {
            let Some(Ok(packet)) = transport.next().await else {
                return;
            };
            let mut r = Reader::new(packet);
            let xid = r.i32().unwrap();
            let op = r.i32().unwrap();
            match op {
                OP_GET_DATA => {
                    let path = r.string().unwrap();
                    if path == "/r/t" {
                        let ok = stat(reply(xid, ERR_OK).buffer(b"payload")).into_bytes();
                        transport.send(ok).await.unwrap();
                        let event = reply(XID_NOTIFICATION, ERR_OK)
                            .i32(WatchEventKind::NodeDataChanged.to_wire())
                            .i32(3)
                            .string("/r/t")
                            .into_bytes();
                        transport.send(event).await.unwrap();
                    } else {
                        let missing = reply(xid, ERR_NO_NODE).into_bytes();
                        transport.send(missing).await.unwrap();
                    }
                }
                OP_PING => {
                    let pong = reply(XID_PING, ERR_OK).into_bytes();
                    transport.send(pong).await.unwrap();
                }
                _ => return,
            }
        }
    }

    #[tokio::test]
    async fn test_get_data_and_watch_against_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(fake_server(listener));

        let client = ZooKeeperClient::connect([addr], Duration::from_secs(3))
            .await
            .unwrap();

        let (data, mut sub) = client.get_data_and_watch("/r/t").await.unwrap();
        assert_eq!(data, b"payload");
        let event = sub.next().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::NodeDataChanged);
        assert_eq!(event.path, "/r/t");

        let err = client.get_data_and_watch("/r/missing").await.unwrap_err();
        assert_eq!(err, CoordinationError::NoNode("/r/missing".into()));

        client.close().await;
        assert_eq!(
            client.get_data_and_watch("/r/t").await.unwrap_err(),
            CoordinationError::Closed
        );
        let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
    }

    #[tokio::test]
    async fn test_oversized_packet_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut transport = Framed::new(socket, frame_codec());
            let _connect = transport.next().await.unwrap().unwrap();
            let mut socket = transport.into_inner();
            socket
                .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        assert!(matches!(
            ZooKeeperClient::connect([addr], Duration::from_secs(3)).await,
            Err(CoordinationError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_fails_without_servers() {
        let client = ZooKeeperClient::new(Vec::<String>::new(), Duration::from_millis(100));
        assert!(matches!(
            client.get_data_and_watch("/r/t").await,
            Err(CoordinationError::Connection(_))
        ));
    }
}
