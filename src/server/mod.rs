//! RPC server.
//!
//! # Data Flow
//! ```text
//! h2c request ──▶ axum fallback ──▶ Metadata from headers (+ remote, timeout)
//!                                          │
//!                         resolve_path ◀───┘
//!                              │
//!           ┌──────────────────┼──────────────────┐
//!           ▼                  ▼                  ▼
//!       UnaryCall          StreamCall           Reject
//!   (decode, handler,   (spawned handler,    (NotFound /
//!    encode)             ReceiverStream)      InvalidArgument)
//!           └──────────── tonic::server::Grpc ────┘
//! ```
//!
//! # Responsibilities
//! - Route every call path through the dispatch table
//! - Build the handler context from inbound metadata
//! - Map `NetError` to a transport status carrying the JSON form
//!
//! # Design Decisions
//! - Payloads cross the transport as raw bytes; the codec chosen by
//!   `x-content-type` runs inside the handler adapter
//! - Unknown methods are rejected before the first message is read

pub mod dispatch;
pub mod stream;

pub use dispatch::{ApiEndpoint, DispatchTable, HandlerDescriptor, MethodKind, RegistryError, ServiceBuilder, ServiceDef, Validate};
pub use stream::ServerStream;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use futures_util::stream::{self as fstream, BoxStream};
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::server::{Grpc, StreamingService, UnaryService};
use tonic::{Code, Status, Streaming};
use tracing::{debug, info, warn};

use crate::codec::{Codec, RawCodec, DEFAULT_CONTENT_TYPE};
use crate::config::ServerConfig;
use crate::context::CallContext;
use crate::errors::NetError;
use crate::metadata::{Metadata, REMOTE};

/// Buffered outbound messages per stream call.
const STREAM_BUFFER: usize = 16;

struct ServerState {
    table: Arc<DispatchTable>,
    max_recv_msg_size: usize,
    max_send_msg_size: usize,
}

/// Serves the handlers of a dispatch table over gRPC framing.
pub struct RpcServer {
    config: ServerConfig,
    table: Arc<DispatchTable>,
}

impl RpcServer {
    pub fn new(config: ServerConfig, table: DispatchTable) -> Self {
        Self::with_table(config, Arc::new(table))
    }

    pub fn with_table(config: ServerConfig, table: Arc<DispatchTable>) -> Self {
        Self { config, table }
    }

    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(ServerState {
            table: Arc::clone(&self.table),
            max_recv_msg_size: self.config.max_recv_msg_size,
            max_send_msg_size: self.config.max_send_msg_size,
        });
        Router::new().fallback(serve_call).with_state(state)
    }

    /// Accept calls until `shutdown` fires, then drain in-flight ones.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        info!(
            address = %addr,
            name = %self.config.name,
            methods = self.table.len(),
            "RPC server starting"
        );

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        info!(name = %self.config.name, "RPC server stopped");
        Ok(())
    }
}

async fn serve_call(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    let path = request.uri().path().to_string();

    let mut md = Metadata::from_http_headers(request.headers());
    if let Some(ConnectInfo(peer)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        md.insert(REMOTE, peer.to_string());
    }
    let timeout = md.take_timeout();
    let content_type = md.content_type().unwrap_or(DEFAULT_CONTENT_TYPE).to_string();

    let mut ctx = CallContext::new(md);
    if let Some(timeout) = timeout {
        ctx = ctx.with_timeout(timeout);
    }

    let mut grpc = Grpc::new(RawCodec).apply_max_message_size_config(Some(state.max_recv_msg_size), Some(state.max_send_msg_size));

    let Some(descriptor) = state.table.resolve_path(&path) else {
        warn!(path = %path, "Unknown method");
        let err = NetError::not_found(format!("method not found: {path}"));
        return grpc.streaming(Reject(err), request).await.map(Body::new);
    };
    let Some(codec) = state.table.codecs().lookup(&content_type) else {
        let err = NetError::bad_request(format!("codec not found: {content_type}"));
        return grpc.streaming(Reject(err), request).await.map(Body::new);
    };

    debug!(
        path = %path,
        method = %descriptor.name(),
        request_id = ctx.metadata().request_id().unwrap_or_default(),
        "Dispatching call"
    );

    let descriptor = Arc::clone(descriptor);
    if descriptor.is_stream() {
        grpc.streaming(StreamCall { descriptor, codec, ctx }, request)
            .await
            .map(Body::new)
    } else {
        grpc.unary(UnaryCall { descriptor, codec, ctx }, request)
            .await
            .map(Body::new)
    }
}

type CallFuture<T> = Pin<Box<dyn Future<Output = Result<tonic::Response<T>, Status>> + Send>>;

struct UnaryCall {
    descriptor: Arc<HandlerDescriptor>,
    codec: Codec,
    ctx: CallContext,
}

impl UnaryService<Bytes> for UnaryCall {
    type Response = Bytes;
    type Future = CallFuture<Bytes>;

    fn call(&mut self, request: tonic::Request<Bytes>) -> Self::Future {
        let descriptor = Arc::clone(&self.descriptor);
        let codec = self.codec;
        let ctx = self.ctx.clone();
        Box::pin(async move {
            descriptor
                .call_unary(ctx, codec, request.into_inner())
                .await
                .map(tonic::Response::new)
                .map_err(|err| to_status(&err))
        })
    }
}

struct StreamCall {
    descriptor: Arc<HandlerDescriptor>,
    codec: Codec,
    ctx: CallContext,
}

impl StreamingService<Bytes> for StreamCall {
    type Response = Bytes;
    type ResponseStream = ReceiverStream<Result<Bytes, Status>>;
    type Future = CallFuture<Self::ResponseStream>;

    fn call(&mut self, request: tonic::Request<Streaming<Bytes>>) -> Self::Future {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let inbound: BoxStream<'static, Result<Bytes, Status>> = request.into_inner().boxed();
        let ctx = self.ctx.clone();
        let cancel = ctx.cancellation_token();
        let name = self.descriptor.name().to_string();
        let handler = self
            .descriptor
            .call_stream(ctx, ServerStream::new(self.codec, inbound, tx.clone()));

        let watch = tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = handler => {
                    if let Err(err) = result {
                        debug!(method = %name, error = %err, "Stream handler failed");
                        let _ = tx.send(Err(to_status(&err))).await;
                    }
                }
                _ = watch.closed() => {
                    cancel.cancel();
                    debug!(method = %name, "Stream client went away");
                }
            }
        });

        Box::pin(std::future::ready(Ok(tonic::Response::new(ReceiverStream::new(rx)))))
    }
}

struct Reject(NetError);

impl StreamingService<Bytes> for Reject {
    type Response = Bytes;
    type ResponseStream = fstream::Empty<Result<Bytes, Status>>;
    type Future = std::future::Ready<Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, _request: tonic::Request<Streaming<Bytes>>) -> Self::Future {
        std::future::ready(Err(to_status(&self.0)))
    }
}

/// Transport status for a handler error. The message is the error's
/// JSON form so the caller can rebuild it.
pub fn to_status(err: &NetError) -> Status {
    let code = match err.status {
        400 => Code::InvalidArgument,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::NotFound,
        408 => Code::DeadlineExceeded,
        500 => Code::Internal,
        501 => Code::Unimplemented,
        503 => Code::Unavailable,
        _ => Code::Unknown,
    };
    Status::new(code, err.to_json())
}
