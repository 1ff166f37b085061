//! HTTP and WebSocket entry points.
//!
//! # Data Flow
//! ```text
//! POST {prefix}/{service}/{endpoint}
//!     → auth hook → payload extraction → Metadata (headers, x-content-type, request_id)
//!     → remote: RpcClient::invoke_by_gate("{service}:{grpc_port}")
//!       native: DispatchTable
//!     → binary replies transcoded to JSON → 200 application/json
//!
//! GET {prefix}/{service}/{endpoint} (Upgrade: websocket)
//!     → auth hook → upgrade → duplex call → bridge
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Request, State};
use axum::http::{header, HeaderMap, Method};
use axum::response::Response;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::payload::{self, PayloadKind};
use super::response::{error_response, json_response};
use super::{bridge, native, Backend, GatewayState};
use crate::client::RpcClient;
use crate::codec::{normalize_content_type, Codec, APPLICATION_JSON};
use crate::context::CallContext;
use crate::errors::NetError;
use crate::metadata::{new_request_id, Metadata, REQUEST_ID, X_CONTENT_TYPE};
use crate::observability::metrics;

/// `{service}/{endpoint}[/...]` → (service, endpoint).
pub(crate) fn parse_target(rest: &str) -> Result<(String, String), NetError> {
    let mut segments = rest.trim_start_matches('/').split('/');
    let service = segments.next().unwrap_or_default();
    let endpoint = segments.next().unwrap_or_default();
    if service.is_empty() {
        return Err(NetError::bad_request(format!("[gate] service is empty url:{rest}")));
    }
    if endpoint.is_empty() {
        return Err(NetError::bad_request(format!("[gate] endpoint is empty url:{rest}")));
    }
    Ok((service.to_string(), endpoint.to_string()))
}

fn call_metadata(headers: &HeaderMap, content_type: &str, request_id: &str) -> Metadata {
    let mut md = Metadata::from_http_headers(headers);
    md.insert(X_CONTENT_TYPE, content_type);
    md.insert(REQUEST_ID, request_id);
    md
}

fn target_addr(client: &RpcClient, service: &str, grpc_port: u16) -> String {
    client
        .service_addr(service)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{service}:{grpc_port}"))
}

pub(crate) async fn http_call(State(state): State<Arc<GatewayState>>, Path(rest): Path<String>, request: Request) -> Response {
    let start = Instant::now();
    let url = request.uri().to_string();
    let request_id = new_request_id();

    match serve_http(&state, &rest, &request_id, request).await {
        Ok(body) => {
            info!(
                request_id = %request_id,
                url = %url,
                cost_ms = start.elapsed().as_millis() as u64,
                "[gate] success"
            );
            metrics::record_gateway_request("http", 200, start);
            json_response(body)
        }
        Err(err) => {
            warn!(
                request_id = %request_id,
                url = %url,
                cost_ms = start.elapsed().as_millis() as u64,
                status = err.status,
                error = %err,
                "[gate] request failed"
            );
            metrics::record_gateway_request("http", err.status, start);
            error_response(&err)
        }
    }
}

async fn serve_http(state: &GatewayState, rest: &str, request_id: &str, request: Request) -> Result<Bytes, NetError> {
    let (parts, body) = request.into_parts();
    state.authorize(&parts)?;
    let (service, endpoint) = parse_target(rest)?;

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(normalize_content_type)
        .unwrap_or_default();
    let path = parts.uri.path().to_string();
    let ctx = CallContext::new(call_metadata(&parts.headers, &content_type, request_id));

    let (kind, payload) = payload::extract(Request::from_parts(parts, body), state.config.max_body_size).await?;

    match &state.backend {
        Backend::Remote(client) => {
            let addr = target_addr(client, &service, state.config.grpc_port);
            let reply = client.invoke_by_gate(&ctx, &addr, &service, &endpoint, payload).await?;
            if kind == PayloadKind::Binary {
                let codec = client.codecs().lookup(&content_type).unwrap_or(Codec::MsgPack);
                return codec
                    .to_json(reply)
                    .map_err(|e| NetError::bad_request(format!("[gate] transcode reply: {e}")));
            }
            Ok(reply)
        }
        Backend::Native(table) => native::call(table, ctx, &path, &endpoint, &content_type, payload).await,
    }
}

pub(crate) async fn ws_call(State(state): State<Arc<GatewayState>>, Path(rest): Path<String>, request: Request) -> Response {
    let start = Instant::now();
    let (mut parts, _body) = request.into_parts();

    let rejected = |err: NetError| {
        warn!(url = %rest, status = err.status, error = %err, "[gate] websocket rejected");
        metrics::record_gateway_request("ws", err.status, start);
        error_response(&err)
    };

    if let Err(err) = state.authorize(&parts) {
        return rejected(err);
    }
    let (service, endpoint) = match parse_target(&rest) {
        Ok(target) => target,
        Err(err) => return rejected(err),
    };
    let Backend::Remote(client) = &state.backend else {
        return rejected(NetError::not_implemented("[gate] websocket needs a remote backend"));
    };
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejected(NetError::bad_request(format!("[gate] {rejection}"))),
    };

    let request_id = new_request_id();
    let md = call_metadata(&parts.headers, APPLICATION_JSON, &request_id);
    let addr = target_addr(client, &service, state.config.grpc_port);
    let client = client.clone();
    let sessions = state.sessions.clone();
    let closing = state.closing.clone();
    let ping_period = state.config.ws_ping_period();
    metrics::record_gateway_request("ws", 101, start);

    upgrade
        .max_message_size(state.config.ws_max_message_size)
        .on_upgrade(move |mut socket| async move {
            let _session = sessions.track();
            let ctx = CallContext::child_of(&closing, md);
            let stream = match client.target(&addr).new_stream(&ctx, &service, &endpoint).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(request_id = %request_id, addr = %addr, error = %err, "[gate] backend stream failed to open");
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
            };
            debug!(request_id = %request_id, addr = %addr, service = %service, endpoint = %endpoint, "[gate] bridge session started");
            bridge::bridge(socket, stream, ctx.cancellation_token(), ping_period).await;
        })
}

pub(crate) async fn options_call() -> Response {
    json_response(Bytes::new())
}

pub(crate) async fn method_not_supported(method: Method, request: Request) -> Response {
    let err = NetError::bad_request(format!("[gate] req method:{method} not support url:{}", request.uri()));
    error_response(&err)
}

pub(crate) async fn not_found(request: Request) -> Response {
    error_response(&NetError::not_found(format!("[gate] no route for {}", request.uri().path())))
}
