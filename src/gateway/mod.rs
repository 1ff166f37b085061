//! HTTP/WebSocket gateway.
//!
//! # Data Flow
//! ```text
//! Client ──▶ CatchPanic ──▶ Trace ──▶ body limit ──▶ {prefix}/{*rest}
//!                                                       │
//!                  ┌──────────── POST ──────────────────┼──── GET (upgrade) ───┐
//!                  ▼                                    │                      ▼
//!        payload → RpcClient / DispatchTable        OPTIONS → 200        bridge (4 pumps)
//!                  │
//!                  ▼
//!        application/json  |  NetError JSON + status
//! ```
//!
//! # Responsibilities
//! - Translate HTTP calls into RPC calls and replies into JSON
//! - Bridge WebSocket sessions onto duplex calls
//! - Run the auth hook before any other work
//!
//! # Design Decisions
//! - One route per prefix; service and endpoint come from the path
//! - Panics anywhere on the request path become a 500 JSON body
//! - Callers can wrap `router()` in their own tower layers

pub mod bridge;
pub mod handler;
pub mod native;
pub mod payload;
pub mod response;

pub use bridge::{SessionReport, CHANNEL_CAPACITY};
pub use payload::PayloadKind;
pub use response::{error_response, json_response};

use std::any::Any;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::request::Parts;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::client::RpcClient;
use crate::config::{AuthConfig, GatewayConfig};
use crate::errors::NetError;
use crate::net::connection::SessionTracker;
use crate::observability::logging::panic_message;
use crate::server::DispatchTable;

/// Request check run before any gateway work. Returning an error ends the
/// request with that error.
pub type AuthHook = Arc<dyn Fn(&Parts) -> Result<(), NetError> + Send + Sync>;

/// Where calls go.
#[derive(Clone)]
pub(crate) enum Backend {
    Remote(RpcClient),
    Native(Arc<DispatchTable>),
}

pub(crate) struct GatewayState {
    pub(crate) backend: Backend,
    pub(crate) config: GatewayConfig,
    pub(crate) auth: Option<AuthHook>,
    pub(crate) sessions: SessionTracker,
    /// Parent of every bridge session's context; cancelled on shutdown.
    pub(crate) closing: CancellationToken,
}

impl GatewayState {
    pub(crate) fn authorize(&self, parts: &Parts) -> Result<(), NetError> {
        match &self.auth {
            Some(hook) => hook(parts),
            None => Ok(()),
        }
    }
}

/// Static token check: missing header is 401, unknown token is 403.
#[derive(Debug, Clone)]
pub struct TokenAuth {
    header: String,
    tokens: HashSet<String>,
}

impl TokenAuth {
    pub fn new(header: impl Into<String>, tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.header.clone(), config.tokens.iter().cloned())
    }

    pub fn check(&self, parts: &Parts) -> Result<(), NetError> {
        let token = parts
            .headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NetError::unauthorized(format!("missing {} header", self.header)))?;
        if self.tokens.contains(token) {
            Ok(())
        } else {
            Err(NetError::forbidden("invalid token"))
        }
    }

    pub fn into_hook(self) -> AuthHook {
        Arc::new(move |parts| self.check(parts))
    }
}

/// Assembles a [`GatewayServer`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    backend: Backend,
    auth: Option<AuthHook>,
}

impl GatewayBuilder {
    /// Forward calls to remote servers through `client`.
    pub fn remote(config: GatewayConfig, client: RpcClient) -> Self {
        Self::with_backend(config, Backend::Remote(client))
    }

    /// Serve calls from a local dispatch table.
    pub fn native(config: GatewayConfig, table: Arc<DispatchTable>) -> Self {
        Self::with_backend(config, Backend::Native(table))
    }

    fn with_backend(config: GatewayConfig, backend: Backend) -> Self {
        let auth = config
            .auth
            .as_ref()
            .map(|auth| TokenAuth::from_config(auth).into_hook());
        Self { config, backend, auth }
    }

    /// Replace the auth hook.
    pub fn auth<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Parts) -> Result<(), NetError> + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> GatewayServer {
        GatewayServer {
            state: Arc::new(GatewayState {
                backend: self.backend,
                config: self.config,
                auth: self.auth,
                sessions: SessionTracker::new(),
                closing: CancellationToken::new(),
            }),
        }
    }
}

/// HTTP/WebSocket front for RPC services.
pub struct GatewayServer {
    state: Arc<GatewayState>,
}

impl GatewayServer {
    pub fn builder(config: GatewayConfig, client: RpcClient) -> GatewayBuilder {
        GatewayBuilder::remote(config, client)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.state.sessions
    }

    pub fn router(&self) -> Router {
        let path = format!("{}/{{*rest}}", self.state.config.prefix);
        let routes = post(handler::http_call)
            .get(handler::ws_call)
            .options(handler::options_call)
            .fallback(handler::method_not_supported);

        Router::new()
            .route(&path, routes)
            .fallback(handler::not_found)
            .with_state(Arc::clone(&self.state))
            .layer(
                ServiceBuilder::new()
                    .layer(CatchPanicLayer::custom(panic_response))
                    .layer(TraceLayer::new_for_http())
                    .layer(DefaultBodyLimit::max(self.state.config.max_body_size)),
            )
    }

    /// Serve until `shutdown` fires. Open bridge sessions are cancelled
    /// and given a short grace period to tear down.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        info!(
            address = %addr,
            prefix = %self.state.config.prefix,
            "Gateway starting"
        );

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let closing = self.state.closing.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                closing.cancel();
            })
            .await?;

        if !self.state.sessions.drain(Duration::from_secs(5)).await {
            info!(active = self.state.sessions.active_count(), "Gateway stopped with open sessions");
        }
        info!("Gateway stopped");
        Ok(())
    }
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let msg = panic_message(payload.as_ref());
    error!(panic = %msg, "[gate] request panicked");
    error_response(&NetError::internal(format!("[gate] panic recovered: {msg}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    fn parts(token: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/rpc/sso/AuthService.Refresh");
        if let Some(token) = token {
            builder = builder.header("AuthToken", token);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn token_auth() {
        let auth = TokenAuth::new("AuthToken", ["good".to_string()]);
        assert!(auth.check(&parts(Some("good"))).is_ok());
        assert_eq!(auth.check(&parts(None)).unwrap_err().status, 401);
        assert_eq!(auth.check(&parts(Some(""))).unwrap_err().status, 401);
        assert_eq!(auth.check(&parts(Some("bad"))).unwrap_err().status, 403);
    }

    fn gateway() -> GatewayServer {
        let table = Arc::new(DispatchTable::new());
        GatewayBuilder::native(GatewayConfig::default(), table)
            .auth(|parts| {
                if parts.uri.path().ends_with("/Panic") {
                    panic!("auth hook blew up");
                }
                Ok(())
            })
            .build()
    }

    async fn send(method: Method, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = gateway().router().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn routing_rules() {
        assert_eq!(send(Method::OPTIONS, "/rpc/sso/A.B").await, (StatusCode::OK, String::new()));

        let (status, body) = send(Method::PUT, "/rpc/sso/A.B").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("not support"));

        let (status, body) = send(Method::GET, "/elsewhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.ends_with("}\n"));

        let (status, body) = send(Method::POST, "/rpc/sso").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("endpoint is empty"));

        let (status, _) = send(Method::POST, "/rpc/sso/Missing.Method").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(Method::GET, "/rpc/sso/A.B").await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn panics_become_500_json() {
        let (status, body) = send(Method::POST, "/rpc/sso/Panic").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let err: NetError = serde_json::from_str(body.trim_end()).unwrap();
        assert!(err.msg.contains("auth hook blew up"));
    }
}
