//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Logging, panic hook, metrics
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     broadcast → servers stop accepting → in-flight calls drain → exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then observability, then listeners
//! - Every server takes a `broadcast::Receiver<()>` and owns its own drain

pub mod shutdown;
pub mod signals;
pub mod startup;
