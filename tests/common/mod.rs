//! Shared fixtures: an RPC server with test services and a gateway in
//! front of it, both on ephemeral ports.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use rpc_gate::client::ClientOptions;
use rpc_gate::config::{AuthConfig, GatewayConfig, ServerConfig};
use rpc_gate::server::{ServiceDef, Validate};
use rpc_gate::{DispatchTable, Errno, GatewayBuilder, HandlerError, NetError, RpcClient, RpcServer, ServiceBuilder, Shutdown};

pub const AUTH_HEADER: &str = "authtoken";
pub const TOKEN: &str = "secret-token";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RefreshReq {
    pub id: i64,
}

impl Validate for RefreshReq {
    fn validate(&self) -> Result<(), String> {
        if self.id < 0 {
            return Err("id must not be negative".into());
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RefreshResp {
    pub id: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CountReq {
    pub n: u32,
}

impl Validate for CountReq {}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SleepReq {
    pub millis: u64,
}

impl Validate for SleepReq {}

/// Counts handler invocations.
#[derive(Default)]
pub struct AuthService {
    pub calls: AtomicUsize,
}

pub fn auth_service(svc: Arc<AuthService>) -> ServiceDef {
    ServiceBuilder::from_arc("AuthService", svc)
        .unary("Refresh", |svc: Arc<AuthService>, _ctx, req: RefreshReq| async move {
            svc.calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HandlerError>(RefreshResp { id: req.id + 100000 })
        })
        .unary("Locked", |_svc, _ctx, _req: RefreshReq| async move {
            Err::<RefreshResp, HandlerError>(Errno::new(7, 3, "account locked").into())
        })
        .unary("Down", |_svc, _ctx, _req: RefreshReq| async move {
            Err::<RefreshResp, HandlerError>(NetError::service_unavailable("maintenance").into())
        })
        .unary("Sleep", |_svc, _ctx, req: SleepReq| async move {
            tokio::time::sleep(Duration::from_millis(req.millis)).await;
            Ok::<_, HandlerError>(RefreshResp { id: req.millis as i64 })
        })
        .build()
}

pub fn stream_service() -> ServiceDef {
    ServiceBuilder::new("StreamService", ())
        .duplex("Echo", |_svc, _ctx, mut stream| async move {
            while let Some(msg) = stream.recv_raw().await? {
                stream.send_raw(msg).await?;
            }
            Ok::<_, HandlerError>(())
        })
        .duplex("Fail", |_svc, _ctx, mut stream| async move {
            let _ = stream.recv_raw().await?;
            Err::<(), HandlerError>(NetError::internal("backend exploded").into())
        })
        .server_stream("Count", |_svc, _ctx, req: CountReq, mut stream| async move {
            for i in 0..req.n {
                stream.send(&RefreshResp { id: i as i64 }).await?;
            }
            Ok::<_, HandlerError>(())
        })
        .build()
}

pub struct Harness {
    pub rpc_addr: SocketAddr,
    pub gateway_url: String,
    pub ws_url: String,
    pub auth: Arc<AuthService>,
    pub client: RpcClient,
    pub shutdown: Arc<Shutdown>,
}

impl Harness {
    pub fn gate(&self) -> gate_sdk::GateClient {
        gate_sdk::GateClient::new(&self.gateway_url).with_header(AUTH_HEADER, TOKEN)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub fn table(auth: Arc<AuthService>) -> DispatchTable {
    let mut table = DispatchTable::new();
    table.register(auth_service(auth)).unwrap();
    table.register(stream_service()).unwrap();
    table
}

pub async fn start_rpc_server(table: DispatchTable, shutdown: &Shutdown) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RpcServer::new(ServerConfig::default(), table);
    tokio::spawn(server.run(listener, shutdown.subscribe()));
    addr
}

pub async fn start() -> Harness {
    start_with(ClientOptions::default()).await
}

/// Server plus gateway; `sso` and `stream` are mapped to the server.
pub async fn start_with(options: ClientOptions) -> Harness {
    let shutdown = Arc::new(Shutdown::new());
    let auth = Arc::new(AuthService::default());
    let rpc_addr = start_rpc_server(table(Arc::clone(&auth)), &shutdown).await;

    let services = HashMap::from([
        ("sso".to_string(), rpc_addr.to_string()),
        ("stream".to_string(), rpc_addr.to_string()),
    ]);
    let client = RpcClient::with_services(options, services);

    let config = GatewayConfig {
        bind_address: "127.0.0.1:0".to_string(),
        ws_ping_period_secs: 1,
        auth: Some(AuthConfig {
            header: AUTH_HEADER.to_string(),
            tokens: vec![TOKEN.to_string()],
        }),
        ..GatewayConfig::default()
    };
    let gateway = GatewayBuilder::remote(config, client.clone()).build();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();
    tokio::spawn(gateway.run(listener, shutdown.subscribe()));

    Harness {
        rpc_addr,
        gateway_url: format!("http://{gateway_addr}"),
        ws_url: format!("ws://{gateway_addr}"),
        auth,
        client,
        shutdown,
    }
}
