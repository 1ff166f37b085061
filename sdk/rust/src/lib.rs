//! HTTP client for calling services through an rpc-gate gateway.

pub mod client;

pub use client::{GateClient, GateError, GateReply};
