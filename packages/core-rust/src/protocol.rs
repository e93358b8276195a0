//! Line-oriented wire protocol.
//!
//! Requests are `\n`-terminated UTF-8 lines split on whitespace; the first
//! token names the command. Every request yields exactly one response: a
//! single JSON object `{"code": <int>, "data": <string|object>}` terminated
//! by CRLF.

use serde::Serialize;
use serde_json::Value;

/// Byte that terminates a request line.
pub const LINE_SEPARATOR: u8 = b'\n';

/// Bytes appended after every serialized response.
pub const RESPONSE_TERMINATOR: &[u8] = b"\r\n";

/// Wire return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Success,
    NoSuchCommand,
    InvalidArguments,
    GeneralError,
}

impl ReturnCode {
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Success => 0,
            Self::NoSuchCommand => 100,
            Self::InvalidArguments => 200,
            Self::GeneralError => 300,
        }
    }
}

/// Uniform result envelope written back for every command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub code: u16,
    pub data: Value,
}

impl Response {
    #[must_use]
    pub fn new(code: ReturnCode, data: Value) -> Self {
        Self {
            code: code.as_u16(),
            data,
        }
    }

    #[must_use]
    pub fn success(data: Value) -> Self {
        Self::new(ReturnCode::Success, data)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == ReturnCode::Success.as_u16()
    }

    /// Serializes the envelope followed by CRLF.
    #[must_use]
    pub fn to_line(&self) -> Vec<u8> {
        // Serializing a `u16` and a `Value` cannot fail.
        let mut line = serde_json::to_vec(self).unwrap_or_default();
        line.extend_from_slice(RESPONSE_TERMINATOR);
        line
    }
}

/// Splits a request line into whitespace-separated tokens.
///
/// Returns an empty vector for blank lines, which callers skip.
#[must_use]
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}
