//! RPC client.
//!
//! # Data Flow
//! ```text
//! CallContext ──▶ Metadata::outbound (+ timeout) ──▶ codec lookup
//!      │
//!      ▼
//! PoolManager::acquire(addr) ──▶ spawned call task ──┐
//!                                                    ├─ select! ──▶ release
//!                  ctx cancel / deadline ────────────┘
//! ```
//!
//! # Responsibilities
//! - Unary and duplex calls over pooled tonic channels
//! - Classify transport failures into `NetError`
//! - Evict the pool of an address that reports itself unavailable
//! - Audit-log successful calls
//!
//! # Design Decisions
//! - The network call runs on its own task; the caller's future only
//!   waits on it, so a stuck call never pins the caller past its deadline
//! - The pool slot is released on every path, including cancellation
//! - No retries

pub mod connector;
pub mod pool;
pub mod stream;

pub use connector::{GrpcConnector, RpcChannel};
pub use pool::{ConnState, Connector, PoolConfig, PoolError, PoolManager, PoolStats, PooledConn, Transport};
pub use stream::{ClientStream, StreamCloser, StreamReceiver, StreamSender};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::uri::PathAndQuery;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tonic::{Code, Status};
use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecRegistry, RawCodec, DEFAULT_CONTENT_TYPE, MULTIPART_FORM};
use crate::config::ClientConfig;
use crate::context::CallContext;
use crate::errors::NetError;
use crate::metadata::{Metadata, X_CONTENT_TYPE};
use crate::observability::metrics;

/// Buffered outbound messages per duplex call.
const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub pool: PoolConfig,
    pub dial_timeout: Duration,
    /// Deadline used when the caller's context has none.
    pub request_timeout: Duration,
    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,
    pub audit_log: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_recv_msg_size: 16 * 1024 * 1024,
            max_send_msg_size: 16 * 1024 * 1024,
            audit_log: true,
        }
    }
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            pool: config.pool_config(),
            dial_timeout: config.dial_timeout(),
            request_timeout: config.request_timeout(),
            max_recv_msg_size: config.max_recv_msg_size,
            max_send_msg_size: config.max_send_msg_size,
            audit_log: config.audit_log,
        }
    }
}

struct ClientInner {
    pools: PoolManager<GrpcConnector>,
    codecs: CodecRegistry,
    options: ClientOptions,
    services: HashMap<String, String>,
}

/// Client factory. Owns the pool manager; cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(options: ClientOptions) -> Self {
        Self::with_parts(options, CodecRegistry::default(), HashMap::new())
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::with_parts(
            ClientOptions::from(config),
            CodecRegistry::default(),
            config.services.clone(),
        )
    }

    /// Client with a service name → address map.
    pub fn with_services(options: ClientOptions, services: HashMap<String, String>) -> Self {
        Self::with_parts(options, CodecRegistry::default(), services)
    }

    pub fn with_parts(options: ClientOptions, codecs: CodecRegistry, services: HashMap<String, String>) -> Self {
        let pools = PoolManager::new(GrpcConnector::new(options.dial_timeout), options.pool.clone());
        Self {
            inner: Arc::new(ClientInner {
                pools,
                codecs,
                options,
                services,
            }),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn pools(&self) -> &PoolManager<GrpcConnector> {
        &self.inner.pools
    }

    /// Address mapped for a service name, if any.
    pub fn service_addr(&self, name: &str) -> Option<&str> {
        self.inner.services.get(name).map(String::as_str)
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.inner.codecs
    }

    /// Map a service name to its address; unknown names are addresses.
    pub fn resolve(&self, target: &str) -> String {
        self.inner
            .services
            .get(target)
            .cloned()
            .unwrap_or_else(|| target.to_string())
    }

    /// Client bound to one destination.
    pub fn target(&self, target: &str) -> ServiceClient {
        ServiceClient {
            client: self.clone(),
            addr: self.resolve(target),
        }
    }

    /// Forward an already encoded payload, as the gateway does.
    pub async fn invoke_by_gate(
        &self,
        ctx: &CallContext,
        target: &str,
        service: &str,
        endpoint: &str,
        payload: Bytes,
    ) -> Result<Bytes, NetError> {
        self.target(target)
            .invoke_raw(ctx, service, endpoint, payload)
            .await
    }

    fn codec_for(&self, md: &Metadata) -> Result<(String, Codec), NetError> {
        let content_type = md
            .get(X_CONTENT_TYPE)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        match self.inner.codecs.lookup(&content_type) {
            Some(codec) => Ok((content_type, codec)),
            None => Err(NetError::bad_request("[rpc-client] codec not found")),
        }
    }

    fn evict(&self, addr: &str) {
        if self.inner.pools.evict(addr) {
            info!(addr, "[rpc-client] remove client");
        }
    }

    fn grpc(&self, conn: &PooledConn<RpcChannel>) -> tonic::client::Grpc<tonic::transport::Channel> {
        tonic::client::Grpc::new(conn.transport().channel())
            .max_decoding_message_size(self.inner.options.max_recv_msg_size)
            .max_encoding_message_size(self.inner.options.max_send_msg_size)
    }
}

/// Calls to one destination address.
#[derive(Clone)]
pub struct ServiceClient {
    client: RpcClient,
    addr: String,
}

impl ServiceClient {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Typed unary call using the codec named by `x-content-type`.
    pub async fn invoke<Req, Resp>(
        &self,
        ctx: &CallContext,
        service: &str,
        endpoint: &str,
        req: &Req,
    ) -> Result<Resp, NetError>
    where
        Req: Serialize + ?Sized,
        Resp: Serialize + DeserializeOwned + Default,
    {
        let (_, codec) = self.client.codec_for(&ctx.metadata().outbound())?;
        let payload = codec
            .encode(req)
            .map_err(|e| NetError::bad_request(format!("[rpc-client] encode request: {e}")))?;
        let reply = self.invoke_raw(ctx, service, endpoint, payload).await?;
        codec
            .decode_or_default(&reply)
            .map_err(|e| NetError::bad_request(format!("[rpc-client] decode reply: {e}")))
    }

    /// Unary call with an encoded payload.
    pub async fn invoke_raw(
        &self,
        ctx: &CallContext,
        service: &str,
        endpoint: &str,
        payload: Bytes,
    ) -> Result<Bytes, NetError> {
        let start = std::time::Instant::now();
        let mut md = ctx.metadata().outbound();
        let (content_type, codec) = self.client.codec_for(&md)?;

        let budget = ctx
            .remaining()
            .unwrap_or(self.client.inner.options.request_timeout);
        md.set_timeout(budget);
        let deadline = Instant::now() + budget;

        let method = method_path(service, endpoint);
        let path = PathAndQuery::try_from(method.clone())
            .map_err(|e| NetError::bad_request(format!("[rpc-client] invalid method {method}: {e}")))?;

        let conn = self
            .client
            .inner
            .pools
            .acquire(&self.addr)
            .await
            .map_err(|e| NetError::bad_request(format!("[rpc-client] Error sending request: {e}")))?;

        let mut grpc = self.client.grpc(&conn);
        let mut request = tonic::Request::new(payload.clone());
        *request.metadata_mut() = md.to_metadata_map();

        let mut call = AbortOnDropHandle::new(tokio::spawn(async move {
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;
            grpc.unary(request, path, RawCodec)
                .await
                .map(tonic::Response::into_inner)
        }));

        let outcome = tokio::select! {
            joined = &mut call => match joined {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(status)) => Err(classify_status(&status)),
                Err(e) => Err(NetError::internal(format!("[rpc-client] call task failed: {e}"))),
            },
            _ = ctx.cancelled() => Err(NetError::timeout("[rpc-client] req fail: context canceled")),
            _ = tokio::time::sleep_until(deadline) => {
                Err(NetError::timeout("[rpc-client] req fail: context deadline exceeded"))
            }
        };
        drop(call);

        let outcome = match outcome {
            Ok(reply) => {
                conn.release(false);
                Ok(reply)
            }
            Err(err) => {
                // Errored calls never return their connection to idle.
                if err.is_unavailable() {
                    conn.transport().mark_failed();
                    self.client.evict(&self.addr);
                }
                conn.release(true);
                Err(err)
            }
        };

        let label = match &outcome {
            Ok(_) => "ok".to_string(),
            Err(err) => err.status.to_string(),
        };
        metrics::record_rpc_call(&method, &label, start);

        match &outcome {
            Ok(reply) => self.audit(&md, codec, &content_type, &method, &payload, reply),
            Err(err) => debug!(
                addr = %self.addr,
                method = %method,
                request_id = md.request_id().unwrap_or_default(),
                status = err.status,
                error = %err.msg,
                "[rpc-client] request failed"
            ),
        }
        outcome
    }

    /// Open a duplex call. Codec and metadata follow the unary rules; a
    /// timeout is forwarded only when the caller set a deadline.
    pub async fn new_stream(&self, ctx: &CallContext, service: &str, endpoint: &str) -> Result<ClientStream, NetError> {
        let mut md = ctx.metadata().outbound();
        let (_, codec) = self.client.codec_for(&md)?;
        if let Some(budget) = ctx.remaining() {
            md.set_timeout(budget);
        }
        let open_deadline = ctx
            .deadline()
            .unwrap_or_else(|| Instant::now() + self.client.inner.options.request_timeout);

        let method = method_path(service, endpoint);
        let path = PathAndQuery::try_from(method.clone())
            .map_err(|e| NetError::bad_request(format!("[rpc-client] invalid method {method}: {e}")))?;

        let conn = self
            .client
            .inner
            .pools
            .acquire(&self.addr)
            .await
            .map_err(|e| NetError::bad_request(format!("[rpc-client] Error sending request: {e}")))?;

        let call_ctx = ctx.child();
        let cancel = call_ctx.cancellation_token();
        let send_closed = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
        let outbound = ReceiverStream::new(rx).take_until(send_closed.clone().cancelled_owned());

        let mut request = tonic::Request::new(outbound);
        *request.metadata_mut() = md.to_metadata_map();
        let mut grpc = self.client.grpc(&conn);

        let opened = async {
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;
            grpc.streaming(request, path, RawCodec).await
        };
        let opened = tokio::select! {
            res = opened => res,
            _ = cancel.cancelled() => Err(Status::cancelled("context canceled")),
            _ = tokio::time::sleep_until(open_deadline) => Err(Status::deadline_exceeded("stream open timed out")),
        };

        let inbound = match opened {
            Ok(response) => response.into_inner(),
            Err(status) => {
                let err = classify_status(&status);
                cancel.cancel();
                if err.is_unavailable() {
                    conn.transport().mark_failed();
                    self.client.evict(&self.addr);
                }
                conn.release(true);
                return Err(NetError::bad_request(format!("Error creating stream: {}", err.msg)));
            }
        };

        debug!(addr = %self.addr, method = %method, request_id = md.request_id().unwrap_or_default(), "[rpc-client] stream opened");

        let client = self.client.clone();
        let addr = self.addr.clone();
        let release = Box::new(move |err: Option<&NetError>| match err {
            Some(err) if err.is_unavailable() => {
                conn.transport().mark_failed();
                conn.release(true);
                client.evict(&addr);
            }
            err => conn.release(err.is_some()),
        });

        Ok(ClientStream::new(
            codec,
            tx,
            inbound.boxed(),
            cancel,
            send_closed,
            release,
        ))
    }

    fn audit(&self, md: &Metadata, codec: Codec, content_type: &str, method: &str, request: &Bytes, reply: &Bytes) {
        if !self.client.inner.options.audit_log || content_type.starts_with(MULTIPART_FORM) {
            return;
        }
        let request_id = md.request_id().unwrap_or_default();
        let request_sq = md.request_sq().unwrap_or_default();
        if codec.is_json() {
            info!(
                request_id,
                request_sq,
                method,
                argv = %String::from_utf8_lossy(request),
                replyv = %String::from_utf8_lossy(reply),
                "[rpc-client] request success"
            );
        } else {
            info!(
                request_id,
                request_sq,
                method,
                argv_len = request.len(),
                replyv_len = reply.len(),
                "[rpc-client] request success"
            );
        }
    }
}

/// Turn a transport status into a `NetError`.
pub(crate) fn classify_status(status: &Status) -> NetError {
    let message = status.message();
    if message.contains("{\"") {
        return NetError::parse(message);
    }
    if status.code() == Code::Unavailable {
        warn!(error = %message, "[rpc-client] service unavailable");
        return NetError::service_unavailable(format!("code = Unavailable desc = {message}"));
    }
    NetError::bad_request(format!("[rpc-client] req fail code = {:?} desc = {message}", status.code()))
}

/// Wire path for a call.
///
/// `Type.Method` endpoints map to `/{service}.{Type}/{Method}`; paths are
/// kept as given; anything else becomes `/{service}/{endpoint}`.
pub fn method_path(service: &str, endpoint: &str) -> String {
    if endpoint.starts_with('/') {
        return endpoint.to_string();
    }
    match endpoint.split_once('.') {
        Some((type_name, method)) if !method.contains('.') => {
            if service.is_empty() {
                format!("/{type_name}/{method}")
            } else {
                format!("/{service}.{type_name}/{method}")
            }
        }
        _ => format!("/{service}/{endpoint}"),
    }
}
