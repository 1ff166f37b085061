//! Error model shared by the client, the server and the gateway.
//!
//! # Data Flow
//! ```text
//! Handler returns HandlerError ──▶ NetError (JSON) ──▶ tonic::Status message
//!                                                          │
//! Gateway HTTP response ◀── NetError::parse ◀── client classify
//! ```
//!
//! # Design Decisions
//! - One structured shape `{code, status, msg}` crosses every boundary
//! - `Display` for `NetError` is its JSON form so it survives embedding in
//!   transport error strings
//! - Business errors (`Errno`) keep their code and travel with status 200

mod errno;
mod net_error;

pub use errno::Errno;
pub use net_error::NetError;

use thiserror::Error;

/// Code reported when request validation rejects the payload.
pub const PARAM_ERROR_CODE: i32 = -1;
/// Code reported when a handler fails with a non-business error.
pub const CALL_ERROR_CODE: i32 = -2;

/// Error returned by a registered handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Application-defined failure with its own code.
    #[error("{0}")]
    Business(Errno),

    /// Already-classified error, passed through unchanged.
    #[error("{0}")]
    Net(NetError),

    /// Anything else; reported as a generic call failure.
    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn other(err: impl std::fmt::Display) -> Self {
        Self::Other(err.to_string())
    }

    /// Translate into the structure that goes on the wire.
    pub fn into_net_error(self) -> NetError {
        match self {
            Self::Business(errno) => NetError::business(errno.code(), errno.msg()),
            Self::Net(err) => err,
            Self::Other(msg) => NetError::business(CALL_ERROR_CODE, format!("call error: {msg}")),
        }
    }
}

impl From<Errno> for HandlerError {
    fn from(errno: Errno) -> Self {
        Self::Business(errno)
    }
}

impl From<NetError> for HandlerError {
    fn from(err: NetError) -> Self {
        Self::Net(err)
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self::Other(msg)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self::Other(msg.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::other(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::other(err)
    }
}
