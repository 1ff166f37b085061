use std::fmt;

use serde::{Deserialize, Serialize};

/// Business error number.
///
/// Codes are namespaced per project: `project * 1000 + code`. The
/// predefined values use project 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Errno {
    code: i32,
    msg: String,
}

impl Errno {
    pub const OK_CODE: i32 = 0;
    pub const FAIL_CODE: i32 = -1;
    pub const PARAM_ERR_CODE: i32 = -2;
    pub const SYSTEM_ERR_CODE: i32 = -3;

    pub fn new(project: i32, code: i32, msg: impl Into<String>) -> Self {
        Self {
            code: project * 1000 + code,
            msg: msg.into(),
        }
    }

    /// Build from an already composed code.
    pub fn from_code(code: i32, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into() }
    }

    pub fn ok() -> Self {
        Self::from_code(Self::OK_CODE, "OK")
    }

    pub fn fail() -> Self {
        Self::from_code(Self::FAIL_CODE, "FAIL")
    }

    pub fn param_err() -> Self {
        Self::from_code(Self::PARAM_ERR_CODE, "PARAM ERROR")
    }

    pub fn system_err() -> Self {
        Self::from_code(Self::SYSTEM_ERR_CODE, "SYSTEM ERROR")
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK_CODE
    }

    /// Same code, different message.
    pub fn with_msg(&self, msg: impl Into<String>) -> Self {
        Self::from_code(self.code, msg)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}: {}", self.code, self.msg)
    }
}

impl std::error::Error for Errno {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_namespacing() {
        assert_eq!(Errno::new(12, 34, "x").code(), 12034);
        assert_eq!(Errno::new(0, -1, "x").code(), -1);
    }

    #[test]
    fn predefined() {
        assert!(Errno::ok().is_ok());
        assert_eq!(Errno::fail().code(), -1);
        assert_eq!(Errno::param_err().code(), -2);
        assert_eq!(Errno::system_err().with_msg("disk").msg(), "disk");
    }
}
