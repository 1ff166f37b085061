//! RPC fabric: pooled client, dispatch-table server and HTTP/WebSocket gateway.

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod errors;
pub mod gateway;
pub mod lifecycle;
pub mod metadata;
pub mod net;
pub mod observability;
pub mod server;

pub use client::{ClientOptions, ClientStream, RpcClient, ServiceClient};
pub use codec::{Codec, CodecRegistry};
pub use config::GateConfig;
pub use context::CallContext;
pub use errors::{Errno, HandlerError, NetError};
pub use gateway::{GatewayBuilder, GatewayServer};
pub use lifecycle::shutdown::Shutdown;
pub use metadata::Metadata;
pub use server::{ApiEndpoint, DispatchTable, RpcServer, ServerStream, ServiceBuilder, Validate};
