use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The six protocol-level error kinds.
///
/// Every error that crosses the wire carries exactly one of these, spelled
/// in snake_case inside an `["error", kind, message, data?]` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    CapRevoked,
    PermissionDenied,
    Canceled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::CapRevoked => "cap_revoked",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Parse the wire spelling. Unknown kinds map to `Internal` so a newer
    /// peer cannot wedge an older one with a kind it does not know.
    pub fn parse(s: &str) -> Self {
        match s {
            "bad_request" => ErrorKind::BadRequest,
            "not_found" => ErrorKind::NotFound,
            "cap_revoked" => ErrorKind::CapRevoked,
            "permission_denied" => ErrorKind::PermissionDenied,
            "canceled" => ErrorKind::Canceled,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol error value.
///
/// `RpcError` is both the failure payload of `reject`/`abort` frames and the
/// error type surfaced to awaiters. It is an in-band value, not an exception
/// during transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RpcError {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(kind: ErrorKind, message: impl Into<String>, data: JsonValue) -> Self {
        RpcError {
            kind,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn cap_revoked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CapRevoked, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// The error every pending awaiter receives when the transport drops
    /// before a graceful close.
    pub fn disconnected() -> Self {
        Self::canceled("connection lost")
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
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

/// Hook that rewrites outbound error bodies before they are serialized,
/// e.g. to redact internals from `data`.
pub type ErrorSanitizer = std::sync::Arc<dyn Fn(RpcError) -> RpcError + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_spelling_round_trips() {
        for kind in [
            ErrorKind::BadRequest,
            ErrorKind::NotFound,
            ErrorKind::CapRevoked,
            ErrorKind::PermissionDenied,
            ErrorKind::Canceled,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), kind);
        }
    }

    #[test]
    fn unknown_kind_becomes_internal() {
        assert_eq!(ErrorKind::parse("out_of_cheese"), ErrorKind::Internal);
    }

    #[test]
    fn convenience_constructors() {
        assert_eq!(RpcError::bad_request("x").kind, ErrorKind::BadRequest);
        assert_eq!(RpcError::not_found("x").kind, ErrorKind::NotFound);
        assert_eq!(RpcError::cap_revoked("x").kind, ErrorKind::CapRevoked);
        assert_eq!(
            RpcError::permission_denied("x").kind,
            ErrorKind::PermissionDenied
        );
        assert_eq!(RpcError::canceled("x").kind, ErrorKind::Canceled);
        assert_eq!(RpcError::internal("x").kind, ErrorKind::Internal);
    }

    #[test]
    fn error_display_carries_kind_and_message() {
        let err = RpcError::internal("something went wrong");
        let shown = err.to_string();
        assert!(shown.contains("internal"));
        assert!(shown.contains("something went wrong"));
    }

    #[test]
    fn data_survives_serde() {
        let err = RpcError::with_data(
            ErrorKind::BadRequest,
            "bad id",
            serde_json::json!({"id": 123}),
        );
        let json = serde_json::to_string(&err).unwrap();
        let back: RpcError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
