//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! client / server / gateway
//!     → logging.rs (tracing subscriber, panic hook)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → Prometheus scrape endpoint
//! ```
//!
//! # Design Decisions
//! - `request_id` is a field on every call-level event
//! - Recording a metric without an installed exporter is a no-op

pub mod logging;
pub mod metrics;
