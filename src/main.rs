//! RPC gateway.
//!
//! ```text
//!                   ┌───────────────────────────────────────────────┐
//!   HTTP POST ─────▶│ gateway ── payload ──▶ RpcClient ── pool ─────┼──▶ RPC server
//!   WebSocket ◀────▶│ gateway ── bridge ───▶ duplex call ───────────┼──▶ (dispatch table)
//!                   │                                               │
//!                   │  config · observability · lifecycle           │
//!                   └───────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use rpc_gate::lifecycle::{signals, startup};
use rpc_gate::{GatewayBuilder, RpcClient, Shutdown};

#[derive(Parser)]
#[command(name = "rpc-gate", version, about = "HTTP/WebSocket gateway in front of RPC services")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "RPC_GATE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = startup::init(args.config.as_deref())?;

    tracing::info!("rpc-gate v{} starting", env!("CARGO_PKG_VERSION"));

    let client = RpcClient::from_config(&config.client);
    let gateway = GatewayBuilder::remote(config.gateway.clone(), client).build();

    let listener = TcpListener::bind(&config.gateway.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Arc::new(Shutdown::new());
    let server = tokio::spawn(gateway.run(listener, shutdown.subscribe()));

    let trigger = Arc::clone(&shutdown);
    tokio::spawn(async move {
        signals::wait_for_signal().await;
        trigger.trigger();
    });

    server.await??;
    tracing::info!("Shutdown complete");
    Ok(())
}
