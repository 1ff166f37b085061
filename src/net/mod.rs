//! Connection bookkeeping shared by the client pool and the gateway.
//!
//! ```text
//! pool dial ──▶ ConnectionId
//! ws upgrade ─▶ SessionTracker::track ──▶ SessionGuard (drop ends session)
//! ```

pub mod connection;
pub use connection::{ConnectionId, SessionGuard, SessionTracker};
