// Wire-level error model shared by every layer of the session kernel.
// The tag set is closed: these six codes are the only ones that travel.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    PermissionDenied,
    CapRevoked,
    Canceled,
    Internal,
}

impl ErrorCode {
    /// The tag used on the wire inside `["error", tag, ...]`.
    pub fn wire_tag(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::CapRevoked => "cap_revoked",
            ErrorCode::Canceled => "canceled",
            ErrorCode::Internal => "internal",
        }
    }

    /// Parse a wire tag back into a code. Unknown tags are not part of the
    /// closed set and map to `None`; callers decide how to degrade.
    pub fn from_wire_tag(tag: &str) -> Option<Self> {
        match tag {
            "bad_request" => Some(ErrorCode::BadRequest),
            "not_found" => Some(ErrorCode::NotFound),
            "permission_denied" => Some(ErrorCode::PermissionDenied),
            "cap_revoked" => Some(ErrorCode::CapRevoked),
            "canceled" => Some(ErrorCode::Canceled),
            "internal" => Some(ErrorCode::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_tag())
    }
}

/// Structured RPC error: a code from the closed set, a human message, and
/// optional structured `data` and `stack`. Stacks are redacted on the wire
/// unless the session opts in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: None,
            stack: None,
        }
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn cap_revoked(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CapRevoked, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::bad_request(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::internal(format!("IO error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_round_trip() {
        let codes = [
            ErrorCode::BadRequest,
            ErrorCode::NotFound,
            ErrorCode::PermissionDenied,
            ErrorCode::CapRevoked,
            ErrorCode::Canceled,
            ErrorCode::Internal,
        ];
        for code in codes {
            assert_eq!(ErrorCode::from_wire_tag(code.wire_tag()), Some(code));
        }
        assert_eq!(ErrorCode::from_wire_tag("nonsense"), None);
    }

    #[test]
    fn builders_attach_data_and_stack() {
        let err = RpcError::bad_request("Division by zero")
            .with_data(serde_json::json!({"divisor": 0}))
            .with_stack("at divide()");
        assert_eq!(err.code, ErrorCode::BadRequest);
        assert_eq!(err.data, Some(serde_json::json!({"divisor": 0})));
        assert_eq!(err.stack.as_deref(), Some("at divide()"));
    }

    #[test]
    fn display_includes_tag_and_message() {
        let err = RpcError::not_found("no such method");
        assert_eq!(format!("{}", err), "not_found: no such method");
    }
}
