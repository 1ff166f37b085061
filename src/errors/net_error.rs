use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured error that crosses the gateway boundary.
///
/// `status` is the HTTP status the gateway answers with; `code` is the
/// application code (-1 for transport-class errors).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetError {
    pub code: i32,
    pub status: u16,
    pub msg: String,
}

macro_rules! status_ctor {
    ($($(#[$doc:meta])* $name:ident => $status:expr;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(msg: impl Into<String>) -> Self {
                Self::new(-1, $status, msg)
            }
        )*
    };
}

impl NetError {
    pub fn new(code: i32, status: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            status,
            msg: msg.into(),
        }
    }

    /// Handler-reported failure. Travels with HTTP status 200.
    pub fn business(code: i32, msg: impl Into<String>) -> Self {
        Self::new(code, 200, msg)
    }

    status_ctor! {
        bad_request => 400;
        unauthorized => 401;
        forbidden => 403;
        not_found => 404;
        method_not_allowed => 405;
        timeout => 408;
        conflict => 409;
        internal => 500;
        not_implemented => 501;
        bad_gateway => 502;
        /// Marks the destination as unreachable; the client evicts its pool.
        service_unavailable => 503;
        gateway_timeout => 504;
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"status":{},"msg":"{}"}}"#, self.code, self.status, self.msg)
        })
    }

    /// Recover a `NetError` from text that may embed one.
    ///
    /// Anything before the first `{"` is ignored. Text without a parseable
    /// payload becomes a bad-request error carrying the text itself.
    pub fn parse(text: &str) -> Self {
        if let Some(start) = text.find("{\"") {
            let candidate = &text[start..];
            if let Ok(err) = serde_json::from_str::<NetError>(candidate) {
                return err;
            }
            // Trailing text after the object is common in transport strings.
            let mut stream = serde_json::Deserializer::from_str(candidate).into_iter::<NetError>();
            if let Some(Ok(err)) = stream.next() {
                return err;
            }
        }
        Self::bad_request(text)
    }

    pub fn is_unavailable(&self) -> bool {
        self.status == 503
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

impl std::error::Error for NetError {}
