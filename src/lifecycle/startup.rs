//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Initialize logging, the panic hook and the metrics exporter
//!
//! # Design Decisions
//! - Fail fast: any configuration error is fatal
//! - Without a config file every section takes its defaults

use std::net::SocketAddr;
use std::path::Path;

use crate::config::{load_config, ConfigError, GateConfig};
use crate::observability::{logging, metrics};

/// Load configuration and bring up observability.
pub fn init(config_path: Option<&Path>) -> Result<GateConfig, ConfigError> {
    let config = match config_path {
        Some(path) => load_config(path)?,
        None => GateConfig::default(),
    };

    logging::init_logging(&config.observability);
    logging::install_panic_hook();

    tracing::info!(
        config = %config_path.map(|p| p.display().to_string()).unwrap_or_else(|| "<defaults>".into()),
        gateway = %config.gateway.bind_address,
        server = %config.server.bind_address,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    Ok(config)
}
