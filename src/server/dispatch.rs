//! Dynamic dispatch table.
//!
//! Handlers are registered per service through [`ServiceBuilder`], which
//! adapts each typed closure to one of two uniform shapes:
//!
//! ```text
//! unary:  (CallContext, Codec, Bytes)   -> Result<Bytes, NetError>
//! stream: (CallContext, ServerStream)   -> Result<(), NetError>
//! ```
//!
//! Every handler is keyed by `Type.Method`; an [`ApiEndpoint`] can add a
//! URL alias. The table is built before serving and only read afterwards.

use std::any::type_name;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use super::stream::ServerStream;
use crate::codec::{Codec, CodecRegistry};
use crate::context::CallContext;
use crate::errors::{HandlerError, NetError, PARAM_ERROR_CODE};
use crate::observability::{logging::panic_message, metrics};

/// Request-level validation, run before the handler.
pub trait Validate {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl Validate for () {}
impl Validate for serde_json::Value {}
impl<V> Validate for HashMap<String, V> {}
impl<V> Validate for BTreeMap<String, V> {}

/// Optional external description of a method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiEndpoint {
    /// `Type.Method` this entry applies to.
    pub method: String,
    /// Extra lookup key, typically the public URL path.
    pub url: String,
    pub client_stream: bool,
    pub server_stream: bool,
}

impl ApiEndpoint {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn is_stream(&self) -> bool {
        self.client_stream || self.server_stream
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service {service}: empty method name")]
    EmptyName { service: String },

    #[error("handler key {key} already registered by {existing}")]
    DuplicateKey { key: String, existing: String },

    #[error("endpoint {method} declares stream={declared} but handler is {kind:?}")]
    StreamMismatch {
        method: String,
        declared: bool,
        kind: MethodKind,
    },
}

/// Handler shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// `(ctx, req) -> resp`
    Unary,
    /// `(ctx, req, stream)`: first inbound message decoded as `req`.
    ServerStream,
    /// `(ctx, stream)`
    Duplex,
}

impl MethodKind {
    pub fn is_stream(&self) -> bool {
        !matches!(self, MethodKind::Unary)
    }

    fn flags(&self) -> (bool, bool) {
        match self {
            MethodKind::Unary => (false, false),
            MethodKind::ServerStream => (false, true),
            MethodKind::Duplex => (true, true),
        }
    }
}

type UnaryInvoker = Arc<dyn Fn(CallContext, Codec, Bytes) -> BoxFuture<'static, Result<Bytes, NetError>> + Send + Sync>;
type StreamInvoker = Arc<dyn Fn(CallContext, ServerStream) -> BoxFuture<'static, Result<(), NetError>> + Send + Sync>;

#[derive(Clone)]
enum Invoker {
    Unary(UnaryInvoker),
    Stream(StreamInvoker),
}

/// A registered handler. Immutable once in the table.
pub struct HandlerDescriptor {
    name: String,
    aliases: Vec<String>,
    kind: MethodKind,
    request_type: &'static str,
    response_type: &'static str,
    invoker: Invoker,
}

impl HandlerDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn is_stream(&self) -> bool {
        self.kind.is_stream()
    }

    pub fn client_stream(&self) -> bool {
        self.kind.flags().0
    }

    pub fn server_stream(&self) -> bool {
        self.kind.flags().1
    }

    pub fn request_type(&self) -> &'static str {
        self.request_type
    }

    pub fn response_type(&self) -> &'static str {
        self.response_type
    }

    /// Run a unary handler. Panics become internal errors; the context
    /// deadline, if any, bounds the handler.
    pub async fn call_unary(&self, ctx: CallContext, codec: Codec, payload: Bytes) -> Result<Bytes, NetError> {
        let Invoker::Unary(invoker) = &self.invoker else {
            return Err(NetError::bad_request(format!("{} is a stream method", self.name)));
        };
        let start = Instant::now();
        let invoker = Arc::clone(invoker);
        let deadline = ctx.deadline();
        let guarded = AssertUnwindSafe(async move { invoker(ctx, codec, payload).await }).catch_unwind();

        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(NetError::timeout(format!("{} exceeded its deadline", self.name)))),
            },
            None => guarded.await,
        };

        let result = outcome.unwrap_or_else(|panic| {
            let msg = panic_message(panic.as_ref());
            error!(method = %self.name, panic = %msg, "Handler panicked");
            Err(NetError::internal(format!("handler panicked: {msg}")))
        });
        metrics::record_dispatch(&self.name, outcome_label(&result), start);
        result
    }

    /// Future running a stream handler to completion.
    pub(crate) fn call_stream(&self, ctx: CallContext, stream: ServerStream) -> BoxFuture<'static, Result<(), NetError>> {
        let Invoker::Stream(invoker) = &self.invoker else {
            let err = NetError::bad_request(format!("{} is a unary method", self.name));
            return Box::pin(std::future::ready(Err(err)));
        };
        let invoker = Arc::clone(invoker);
        let name = self.name.clone();
        Box::pin(async move {
            let start = Instant::now();
            let outcome = AssertUnwindSafe(async move { invoker(ctx, stream).await })
                .catch_unwind()
                .await;
            let result = outcome.unwrap_or_else(|panic| {
                let msg = panic_message(panic.as_ref());
                error!(method = %name, panic = %msg, "Stream handler panicked");
                Err(NetError::internal(format!("handler panicked: {msg}")))
            });
            metrics::record_dispatch(&name, outcome_label(&result), start);
            result
        })
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("kind", &self.kind)
            .field("request_type", &self.request_type)
            .field("response_type", &self.response_type)
            .finish()
    }
}

fn outcome_label<T>(result: &Result<T, NetError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) if e.status == 200 => "business_error",
        Err(_) => "error",
    }
}

fn decode_request<Req: Serialize + DeserializeOwned + Default>(codec: Codec, payload: &[u8]) -> Result<Req, NetError> {
    codec
        .decode_or_default(payload)
        .map_err(|e| NetError::bad_request(format!("Unmarshal error: {e}")))
}

struct MethodDef {
    method: String,
    kind: MethodKind,
    request_type: &'static str,
    response_type: &'static str,
    invoker: Invoker,
}

/// Collects the methods of one service instance.
pub struct ServiceBuilder<S> {
    name: String,
    instance: Arc<S>,
    methods: Vec<MethodDef>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    pub fn new(name: impl Into<String>, instance: S) -> Self {
        Self::from_arc(name, Arc::new(instance))
    }

    pub fn from_arc(name: impl Into<String>, instance: Arc<S>) -> Self {
        Self {
            name: name.into(),
            instance,
            methods: Vec::new(),
        }
    }

    /// Request/response method.
    pub fn unary<Req, Resp, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: Serialize + DeserializeOwned + Default + Validate + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Arc<S>, CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        let invoker: UnaryInvoker = Arc::new(move |ctx: CallContext, codec: Codec, payload: Bytes| -> BoxFuture<'static, Result<Bytes, NetError>> {
            let req: Req = match decode_request(codec, &payload) {
                Ok(req) => req,
                Err(err) => return Box::pin(std::future::ready(Err(err))),
            };
            if let Err(msg) = req.validate() {
                let err = NetError::business(PARAM_ERROR_CODE, format!("param error: {msg}"));
                return Box::pin(std::future::ready(Err(err)));
            }
            let pending = handler(Arc::clone(&instance), ctx, req);
            Box::pin(async move {
                let resp = pending.await.map_err(HandlerError::into_net_error)?;
                codec
                    .encode(&resp)
                    .map_err(|e| NetError::internal(format!("Marshal error: {e}")))
            })
        });
        self.methods.push(MethodDef {
            method: method.to_string(),
            kind: MethodKind::Unary,
            request_type: type_name::<Req>(),
            response_type: type_name::<Resp>(),
            invoker: Invoker::Unary(invoker),
        });
        self
    }

    /// One request, then a stream of responses (and optionally more
    /// inbound messages) through `ServerStream`.
    pub fn server_stream<Req, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: Serialize + DeserializeOwned + Default + Validate + Send + 'static,
        F: Fn(Arc<S>, CallContext, Req, ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        let handler = Arc::new(handler);
        let invoker: StreamInvoker = Arc::new(move |ctx: CallContext, mut stream: ServerStream| -> BoxFuture<'static, Result<(), NetError>> {
            let instance = Arc::clone(&instance);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let first = stream.recv_raw().await?.unwrap_or_default();
                let req: Req = decode_request(stream.codec(), &first)?;
                if let Err(msg) = req.validate() {
                    return Err(NetError::business(PARAM_ERROR_CODE, format!("param error: {msg}")));
                }
                (*handler)(instance, ctx, req, stream)
                    .await
                    .map_err(HandlerError::into_net_error)
            })
        });
        self.methods.push(MethodDef {
            method: method.to_string(),
            kind: MethodKind::ServerStream,
            request_type: type_name::<Req>(),
            response_type: type_name::<ServerStream>(),
            invoker: Invoker::Stream(invoker),
        });
        self
    }

    /// Pure bidirectional stream.
    pub fn duplex<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Arc<S>, CallContext, ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        let invoker: StreamInvoker = Arc::new(move |ctx: CallContext, stream: ServerStream| -> BoxFuture<'static, Result<(), NetError>> {
            let pending = handler(Arc::clone(&instance), ctx, stream);
            Box::pin(async move { pending.await.map_err(HandlerError::into_net_error) })
        });
        self.methods.push(MethodDef {
            method: method.to_string(),
            kind: MethodKind::Duplex,
            request_type: type_name::<ServerStream>(),
            response_type: type_name::<ServerStream>(),
            invoker: Invoker::Stream(invoker),
        });
        self
    }

    pub fn build(self) -> ServiceDef {
        ServiceDef {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// A service with its instance erased, ready for registration.
pub struct ServiceDef {
    name: String,
    methods: Vec<MethodDef>,
}

impl ServiceDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|m| format!("{}.{}", self.name, m.method))
            .collect()
    }
}

impl<S: Send + Sync + 'static> From<ServiceBuilder<S>> for ServiceDef {
    fn from(builder: ServiceBuilder<S>) -> Self {
        builder.build()
    }
}

/// Key → handler map shared by the RPC server and the native gateway.
pub struct DispatchTable {
    handlers: HashMap<String, Arc<HandlerDescriptor>>,
    codecs: CodecRegistry,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::with_codecs(CodecRegistry::default())
    }

    pub fn with_codecs(codecs: CodecRegistry) -> Self {
        Self {
            handlers: HashMap::new(),
            codecs,
        }
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Register every method of a service under `Type.Method`.
    pub fn register(&mut self, service: impl Into<ServiceDef>) -> Result<usize, RegistryError> {
        let service = service.into();
        let name = service.name;
        let mut added = 0;
        for method in service.methods {
            self.insert(&name, method, None)?;
            added += 1;
        }
        Ok(added)
    }

    /// Register only the methods listed in `endpoints`, with their
    /// aliases. Entries naming no method are logged and ignored.
    pub fn register_with_endpoints(
        &mut self,
        services: impl IntoIterator<Item = ServiceDef>,
        endpoints: &[ApiEndpoint],
    ) -> Result<usize, RegistryError> {
        let mut matched = HashSet::new();
        let mut added = 0;
        for service in services {
            let name = service.name;
            for method in service.methods {
                let full = format!("{}.{}", name, method.method);
                let Some(endpoint) = endpoints.iter().find(|e| e.method == full) else {
                    continue;
                };
                matched.insert(full);
                self.insert(&name, method, Some(endpoint))?;
                added += 1;
            }
        }
        for endpoint in endpoints.iter().filter(|e| !matched.contains(&e.method)) {
            warn!(method = %endpoint.method, url = %endpoint.url, "Endpoint matches no registered method");
        }
        Ok(added)
    }

    fn insert(&mut self, service: &str, method: MethodDef, endpoint: Option<&ApiEndpoint>) -> Result<(), RegistryError> {
        if method.method.is_empty() {
            return Err(RegistryError::EmptyName {
                service: service.to_string(),
            });
        }
        let name = format!("{}.{}", service, method.method);

        let mut aliases = Vec::new();
        if let Some(endpoint) = endpoint {
            if endpoint.is_stream() != method.kind.is_stream() {
                return Err(RegistryError::StreamMismatch {
                    method: name,
                    declared: endpoint.is_stream(),
                    kind: method.kind,
                });
            }
            if !endpoint.url.is_empty() && endpoint.url != name {
                aliases.push(endpoint.url.clone());
            }
        }

        for key in std::iter::once(&name).chain(aliases.iter()) {
            if let Some(existing) = self.handlers.get(key) {
                return Err(RegistryError::DuplicateKey {
                    key: key.clone(),
                    existing: existing.name.clone(),
                });
            }
        }

        let descriptor = Arc::new(HandlerDescriptor {
            name: name.clone(),
            aliases: aliases.clone(),
            kind: method.kind,
            request_type: method.request_type,
            response_type: method.response_type,
            invoker: method.invoker,
        });
        for key in aliases {
            self.handlers.insert(key, Arc::clone(&descriptor));
        }
        self.handlers.insert(name, descriptor);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Arc<HandlerDescriptor>> {
        self.handlers.get(key)
    }

    /// Find the handler for a wire path such as `/pkg.Type/Method`.
    ///
    /// Tries `Type.Method`, then the bare method, then the path itself.
    pub fn resolve_path(&self, path: &str) -> Option<&Arc<HandlerDescriptor>> {
        if let Some((service, method)) = path.trim_start_matches('/').split_once('/') {
            let type_name = service.rsplit('.').next().unwrap_or(service);
            let found = self
                .get(&format!("{type_name}.{method}"))
                .or_else(|| self.get(method));
            if found.is_some() {
                return found;
            }
        }
        self.get(path)
    }

    /// Unary dispatch of an encoded payload.
    pub async fn dispatch(
        &self,
        key: &str,
        content_type: &str,
        payload: Bytes,
        ctx: CallContext,
    ) -> Result<Bytes, NetError> {
        let descriptor = self
            .get(key)
            .ok_or_else(|| NetError::not_found(format!("method not found: {key}")))?;
        let codec = self
            .codecs
            .lookup(content_type)
            .ok_or_else(|| NetError::bad_request(format!("codec not found: {content_type}")))?;
        descriptor.call_unary(ctx, codec, payload).await
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}
