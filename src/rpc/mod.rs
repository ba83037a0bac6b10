//! Request dispatch: frame codec, method registry and the connection loop.

pub mod body;
pub mod codec;
pub mod context;
pub mod registry;
pub mod server;

pub use body::{RpcBody, downcast_body};
pub use codec::{
    DecodeError, DecodedRequest, DecodedResponse, FrameRejection, RawResponse, RequestCodec,
    RequestDecoder, ResponseCodec, ResponseEncoder, encode_request, response_stream,
};
pub use context::{CallContext, CancelSource};
pub use registry::{MethodDefinition, MethodRegistry, RpcHandler};
pub use server::{ConnectionStats, ProxyServer, ServerMetrics, serve_connection};
