//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::PoolConfig;

const MIB: usize = 1024 * 1024;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GateConfig {
    /// Outbound RPC client and its connection pools.
    pub client: ClientConfig,

    /// RPC server.
    pub server: ServerConfig,

    /// HTTP/WebSocket gateway.
    pub gateway: GatewayConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Client and pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Pool capacity per address.
    pub pool_size: usize,

    /// Connection TTL in seconds.
    pub pool_ttl_secs: u64,

    /// Idle connections kept per address.
    pub pool_max_idle: usize,

    /// Concurrent calls per connection.
    pub pool_max_streams: usize,

    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,

    pub dial_timeout_ms: u64,

    /// Deadline for calls whose context has none.
    pub request_timeout_ms: u64,

    /// Log every successful call.
    pub audit_log: bool,

    /// Service name → address.
    pub services: HashMap<String, String>,
}

impl ClientConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(
            self.pool_size,
            Duration::from_secs(self.pool_ttl_secs),
            self.pool_max_idle,
            self.pool_max_streams,
        )
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_size: 100,
            pool_ttl_secs: 60,
            pool_max_idle: 50,
            pool_max_streams: 20,
            max_recv_msg_size: 16 * MIB,
            max_send_msg_size: 16 * MIB,
            dial_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            audit_log: true,
            services: HashMap::new(),
        }
    }
}

/// RPC server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used in logs.
    pub name: String,

    /// Bind address (e.g., "0.0.0.0:10000").
    pub bind_address: String,

    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "rpc-server".to_string(),
            bind_address: "0.0.0.0:10000".to_string(),
            max_recv_msg_size: 16 * MIB,
            max_send_msg_size: 16 * MIB,
        }
    }
}

/// Gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Route prefix; calls live under `{prefix}/{service}/{endpoint}`.
    pub prefix: String,

    /// Port appended to service names without an address mapping.
    pub grpc_port: u16,

    /// Request body limit, multipart included.
    pub max_body_size: usize,

    pub ws_ping_period_secs: u64,
    pub ws_max_message_size: usize,

    /// Static token check; disabled when absent.
    pub auth: Option<AuthConfig>,
}

impl GatewayConfig {
    pub fn ws_ping_period(&self) -> Duration {
        Duration::from_secs(self.ws_ping_period_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            prefix: "/rpc".to_string(),
            grpc_port: 10000,
            max_body_size: 10 * MIB,
            ws_ping_period_secs: 60,
            ws_max_message_size: 4 * MIB,
            auth: None,
        }
    }
}

/// Static token authentication.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Header carrying the token.
    pub header: String,

    /// Accepted tokens.
    pub tokens: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: "authtoken".to_string(),
            tokens: Vec::new(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
