//! Frame codec for requests and responses.
//!
//! Every frame starts with a fixed 32-byte big-endian header:
//!
//! ```text
//! magic "THFT" | version u32 | header_len u32 | body_len u32 |
//! seq_id u64 | app_id u32 | partition_index u32
//! ```
//!
//! A request body is `name_len u16 | name | args`; a response body is
//! `name_len u16 | name | error_code i32 | result` (result only on `ERR_OK`).

use super::body::RpcBody;
use super::registry::{MethodRegistry, RpcHandler};
use crate::core::{ErrorCode, PartitionId, ProxyError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

pub const HEADER_MAGIC: [u8; 4] = *b"THFT";
pub const HEADER_VERSION: u32 = 0;
pub const HEADER_LEN: usize = 32;
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    body_len: usize,
    seq_id: u64,
    partition: PartitionId,
}

impl FrameHeader {
    fn put(&self, dst: &mut BytesMut) {
        dst.put_slice(&HEADER_MAGIC);
        dst.put_u32(HEADER_VERSION);
        dst.put_u32(HEADER_LEN as u32);
        dst.put_u32(self.body_len as u32);
        dst.put_u64(self.seq_id);
        dst.put_u32(self.partition.app_id);
        dst.put_u32(self.partition.partition_index);
    }

    /// Parses a header without consuming it; `src` holds at least `HEADER_LEN` bytes.
    fn peek(src: &[u8]) -> Result<Self> {
        let mut buf = &src[..HEADER_LEN];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != HEADER_MAGIC {
            return Err(ProxyError::Decode(format!("invalid header magic {:?}", magic)));
        }
        let version = buf.get_u32();
        if version != HEADER_VERSION {
            return Err(ProxyError::Decode(format!(
                "unsupported header version {}",
                version
            )));
        }
        let header_len = buf.get_u32();
        if header_len as usize != HEADER_LEN {
            return Err(ProxyError::Decode(format!(
                "unexpected header length {}",
                header_len
            )));
        }
        let body_len = buf.get_u32() as usize;
        if body_len > MAX_BODY_LEN {
            return Err(ProxyError::Decode(format!(
                "body length {} exceeds {}",
                body_len, MAX_BODY_LEN
            )));
        }
        let seq_id = buf.get_u64();
        let app_id = buf.get_u32();
        let partition_index = buf.get_u32();
        Ok(Self {
            body_len,
            seq_id,
            partition: PartitionId::new(app_id, partition_index),
        })
    }
}

/// Splits one complete frame off `src`, or asks for more bytes.
fn split_frame(src: &mut BytesMut) -> Result<Option<(FrameHeader, Bytes)>> {
    if src.len() < HEADER_LEN {
        src.reserve(HEADER_LEN - src.len());
        return Ok(None);
    }
    let header = FrameHeader::peek(src)?;
    let frame_len = HEADER_LEN + header.body_len;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }
    src.advance(HEADER_LEN);
    Ok(Some((header, src.split_to(header.body_len).freeze())))
}

/// End-of-stream is only clean on a frame boundary.
fn check_eof(src: &BytesMut) -> Result<()> {
    if src.is_empty() {
        Ok(())
    } else {
        Err(ProxyError::Decode(format!(
            "stream ended inside a frame ({} bytes buffered)",
            src.len()
        )))
    }
}

fn put_frame(dst: &mut BytesMut, seq_id: u64, partition: PartitionId, body: &[u8]) -> Result<()> {
    if body.len() > MAX_BODY_LEN {
        return Err(ProxyError::Encode(format!(
            "body length {} exceeds {}",
            body.len(),
            MAX_BODY_LEN
        )));
    }
    dst.reserve(HEADER_LEN + body.len());
    FrameHeader {
        body_len: body.len(),
        seq_id,
        partition,
    }
    .put(dst);
    dst.put_slice(body);
    Ok(())
}

fn put_method(body: &mut BytesMut, method: &str) -> Result<()> {
    if !method.is_ascii() || method.len() > u16::MAX as usize {
        return Err(ProxyError::Encode(format!("invalid rpc name '{}'", method)));
    }
    body.put_u16(method.len() as u16);
    body.put_slice(method.as_bytes());
    Ok(())
}

/// Reads `name_len | name` off the front of `body`. The name may be empty.
fn get_method(body: &mut Bytes) -> Result<String> {
    if body.remaining() < 2 {
        return Err(ProxyError::Decode("body too short for rpc name".into()));
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return Err(ProxyError::Decode(format!(
            "rpc name length {} exceeds body",
            len
        )));
    }
    let raw = body.split_to(len);
    match std::str::from_utf8(&raw) {
        Ok(name) if name.is_ascii() => Ok(name.to_string()),
        _ => Err(ProxyError::Decode("rpc name is not ascii".into())),
    }
}

/// Encodes a request frame.
pub fn encode_request(
    seq_id: u64,
    partition: PartitionId,
    method: &str,
    args: &dyn RpcBody,
) -> Result<BytesMut> {
    let payload = args.encode_to()?;
    let mut body = BytesMut::with_capacity(2 + method.len() + payload.len());
    put_method(&mut body, method)?;
    body.put_slice(&payload);

    let mut frame = BytesMut::new();
    put_frame(&mut frame, seq_id, partition, &body)?;
    Ok(frame)
}

/// A request ready for dispatch. Immutable after decode.
pub struct DecodedRequest {
    pub seq_id: u64,
    pub partition: PartitionId,
    pub method: String,
    pub args: Box<dyn RpcBody>,
    pub handler: RpcHandler,
}

impl fmt::Debug for DecodedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedRequest")
            .field("seq_id", &self.seq_id)
            .field("partition", &self.partition)
            .field("method", &self.method)
            .field("args", &self.args)
            .finish()
    }
}

/// Handler outcome paired with the identity of the request it answers.
#[derive(Debug)]
pub struct DecodedResponse {
    pub seq_id: u64,
    pub partition: PartitionId,
    pub method: String,
    pub result: std::result::Result<Box<dyn RpcBody>, ErrorCode>,
}

impl DecodedResponse {
    pub fn ok(request_seq: u64, partition: PartitionId, method: &str, body: Box<dyn RpcBody>) -> Self {
        Self {
            seq_id: request_seq,
            partition,
            method: method.to_string(),
            result: Ok(body),
        }
    }

    pub fn error(request_seq: u64, partition: PartitionId, method: &str, code: ErrorCode) -> Self {
        Self {
            seq_id: request_seq,
            partition,
            method: method.to_string(),
            result: Err(code),
        }
    }
}

/// A fully consumed frame that cannot be dispatched.
#[derive(Debug)]
pub struct FrameRejection {
    pub seq_id: u64,
    pub partition: PartitionId,
    /// Empty when the name itself was unreadable.
    pub method: String,
    pub error: ProxyError,
}

/// Why a request could not be produced.
#[derive(Debug)]
pub enum DecodeError {
    /// Clean end of stream at a frame boundary.
    Eof,
    /// The frame was consumed in full but cannot be dispatched; the stream
    /// is still aligned and the caller can be answered.
    Frame {
        seq_id: u64,
        partition: PartitionId,
        method: String,
        error: ProxyError,
    },
    /// The stream is broken or no longer aligned on a frame boundary.
    Stream(ProxyError),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Eof => f.write_str("end of stream"),
            DecodeError::Frame {
                seq_id,
                method,
                error,
                ..
            } => write!(f, "request #{} ({}): {}", seq_id, method, error),
            DecodeError::Stream(error) => write!(f, "stream: {}", error),
        }
    }
}

/// Server-side request decoder.
///
/// Stream-level failures are the codec error; a frame that parses but cannot
/// be dispatched is yielded as an item so decoding continues after it.
pub struct RequestCodec {
    registry: Arc<MethodRegistry>,
}

impl RequestCodec {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self { registry }
    }

    fn dispatchable(
        &self,
        header: FrameHeader,
        mut body: Bytes,
    ) -> std::result::Result<DecodedRequest, FrameRejection> {
        let reject = |method: String, error: ProxyError| FrameRejection {
            seq_id: header.seq_id,
            partition: header.partition,
            method,
            error,
        };

        let method = match get_method(&mut body) {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => {
                return Err(reject(
                    String::new(),
                    ProxyError::Decode("rpc name is empty".into()),
                ));
            }
            Err(err) => return Err(reject(String::new(), err)),
        };
        let definition = match self.registry.lookup(&method) {
            Ok(definition) => definition,
            Err(err) => return Err(reject(method, err)),
        };

        let mut args = definition.create_request();
        if let Err(err) = args.decode_from(&body) {
            return Err(reject(method, err));
        }

        Ok(DecodedRequest {
            seq_id: header.seq_id,
            partition: header.partition,
            method,
            args,
            handler: Arc::clone(&definition.handler),
        })
    }
}

impl Decoder for RequestCodec {
    type Item = std::result::Result<DecodedRequest, FrameRejection>;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(split_frame(src)?.map(|(header, body)| self.dispatchable(header, body)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => check_eof(src).map(|_| None),
        }
    }
}

/// Decodes requests off a byte stream, one at a time.
pub struct RequestDecoder<R> {
    frames: FramedRead<R, RequestCodec>,
}

impl<R: AsyncRead + Unpin> RequestDecoder<R> {
    pub fn new(reader: R, registry: Arc<MethodRegistry>) -> Self {
        Self {
            frames: FramedRead::new(reader, RequestCodec::new(registry)),
        }
    }

    pub async fn read_request(&mut self) -> std::result::Result<DecodedRequest, DecodeError> {
        match self.frames.next().await {
            None => Err(DecodeError::Eof),
            Some(Ok(Ok(request))) => Ok(request),
            Some(Ok(Err(rejection))) => Err(DecodeError::Frame {
                seq_id: rejection.seq_id,
                partition: rejection.partition,
                method: rejection.method,
                error: rejection.error,
            }),
            Some(Err(err)) => Err(DecodeError::Stream(err)),
        }
    }
}

/// Encodes [`DecodedResponse`]s and decodes them back as [`RawResponse`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseCodec;

impl<'a> Encoder<&'a DecodedResponse> for ResponseCodec {
    type Error = ProxyError;

    fn encode(&mut self, response: &'a DecodedResponse, dst: &mut BytesMut) -> Result<()> {
        // the body is complete before anything reaches dst
        let mut body = BytesMut::new();
        put_method(&mut body, &response.method)?;
        match &response.result {
            Ok(payload) => {
                let payload = payload.encode_to()?;
                body.put_i32(ErrorCode::Ok.as_i32());
                body.put_slice(&payload);
            }
            Err(code) => body.put_i32(code.as_i32()),
        }
        put_frame(dst, response.seq_id, response.partition, &body)
    }
}

impl Decoder for ResponseCodec {
    type Item = RawResponse;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawResponse>> {
        let Some((header, mut body)) = split_frame(src)? else {
            return Ok(None);
        };
        let method = get_method(&mut body)?;
        if body.remaining() < 4 {
            return Err(ProxyError::Decode(
                "response body too short for error code".into(),
            ));
        }
        let error = ErrorCode::from_i32(body.get_i32());
        Ok(Some(RawResponse {
            seq_id: header.seq_id,
            partition: header.partition,
            method,
            error,
            payload: body,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RawResponse>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => check_eof(src).map(|_| None),
        }
    }
}

/// Serializes responses onto a shared writer.
///
/// Each frame is written and flushed under the writer lock, so concurrent
/// senders never interleave partial frames.
pub struct ResponseEncoder<W> {
    sink: Mutex<FramedWrite<W, ResponseCodec>>,
}

impl<W: AsyncWrite + Unpin> ResponseEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            sink: Mutex::new(FramedWrite::new(writer, ResponseCodec)),
        }
    }

    pub async fn send_response(&self, response: &DecodedResponse) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(response).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        SinkExt::<&DecodedResponse>::close(&mut *sink).await
    }
}

/// A response as seen by a caller of the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub seq_id: u64,
    pub partition: PartitionId,
    /// Empty when the request's own name could not be read.
    pub method: String,
    pub error: ErrorCode,
    pub payload: Bytes,
}

impl RawResponse {
    /// Decodes the result payload into `T`.
    pub fn body<T: RpcBody + Default>(&self) -> Result<T> {
        if self.error != ErrorCode::Ok {
            return Err(ProxyError::InvalidData(format!(
                "response #{} carries {}",
                self.seq_id, self.error
            )));
        }
        let mut body = T::default();
        body.decode_from(&self.payload)?;
        Ok(body)
    }
}

/// Stream of responses read off `reader`.
pub fn response_stream<R: AsyncRead>(reader: R) -> FramedRead<R, ResponseCodec> {
    FramedRead::new(reader, ResponseCodec)
}
