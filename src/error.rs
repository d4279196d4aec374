//! Error types for wirelink.
//!
//! Two layers live here:
//! - [`WirelinkError`]: local operational failures (encode/decode, bad
//!   connection status, transport trouble). These never cross the wire.
//! - [`RpcError`]: the typed error that *does* cross the wire inside an
//!   `err` envelope, and the only error a caller of `call_api` ever sees.
//!
//! `call_api` itself never returns `Err`: every failure becomes an
//! [`ApiReturn::Err`] value, so callers have a single error-handling path.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for local wirelink operations.
#[derive(Debug, Error)]
pub enum WirelinkError {
    /// I/O error reported by a transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (text envelopes, bodies).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error (buffer envelopes).
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed envelope (bad tag, truncated frame, missing field).
    #[error("Envelope error: {0}")]
    Envelope(String),

    /// Service name or id not present in the service map.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// Operation not allowed in the current connection status.
    #[error("Invalid connection status: {0}")]
    InvalidStatus(&'static str),

    /// The connection's outbound pipeline has shut down.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A flow middleware canceled the enclosing action.
    #[error("Canceled by {0} flow")]
    Canceled(&'static str),

    /// Transport-reported failure that is not an `std::io::Error`.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias for local operations using [`WirelinkError`].
pub type OpResult<T = ()> = Result<T, WirelinkError>;

/// Category of an [`RpcError`].
///
/// `ApiError` is the only "business" kind; every other kind is
/// infrastructural and raised by the core itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcErrorKind {
    /// Business rule violated; raised by an API handler via `ApiCall::error`.
    ApiError,
    /// Transport failure, request timeout, or lost connection.
    NetworkError,
    /// The server-side handler threw or timed out.
    ServerError,
    /// The client-side handler threw (mirror of `ServerError`).
    ClientError,
    /// The peer reports it failed to decode data we sent.
    RemoteError,
    /// This side failed to encode, decode, or send.
    LocalError,
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RpcErrorKind::ApiError => "ApiError",
            RpcErrorKind::NetworkError => "NetworkError",
            RpcErrorKind::ServerError => "ServerError",
            RpcErrorKind::ClientError => "ClientError",
            RpcErrorKind::RemoteError => "RemoteError",
            RpcErrorKind::LocalError => "LocalError",
        };
        f.write_str(s)
    }
}

/// Error code for a request that timed out waiting for its reply.
pub const CODE_TIMEOUT: &str = "TIMEOUT";
/// Error code for pending calls failed by a disconnect.
pub const CODE_LOST_CONN: &str = "LOST_CONN";
/// Error code for a handler that never replied within the server deadline.
pub const CODE_SERVER_TIMEOUT: &str = "SERVER_TIMEOUT";

/// The typed error carried by `err` envelopes and [`ApiReturn::Err`].
///
/// Besides `message`, `kind`, and the optional short `code`, an error can
/// carry a free-form property bag which round-trips through both envelope
/// variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Human-readable description.
    pub message: String,
    /// Error category.
    #[serde(rename = "type")]
    pub kind: RpcErrorKind,
    /// Optional short machine-readable code (e.g. `TIMEOUT`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Free-form property bag.
    #[serde(flatten)]
    pub props: HashMap<String, serde_json::Value>,
}

impl RpcError {
    /// Create an error with the given kind and message.
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            code: None,
            props: HashMap::new(),
        }
    }

    /// Attach a short code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach a property to the free-form bag.
    pub fn with_prop(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    /// Business error, raised by API handlers.
    pub fn api(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::ApiError, message)
    }

    /// Local encode/decode/send failure.
    pub fn local(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::LocalError, message)
    }

    /// Request timed out waiting for its reply.
    pub fn timeout() -> Self {
        Self::new(RpcErrorKind::NetworkError, "Request Timeout").with_code(CODE_TIMEOUT)
    }

    /// Connection dropped while the call was pending.
    pub fn lost_conn() -> Self {
        Self::new(RpcErrorKind::NetworkError, "Lost connection to remote").with_code(CODE_LOST_CONN)
    }

    /// True for business errors, false for infrastructural ones.
    pub fn is_api_error(&self) -> bool {
        self.kind == RpcErrorKind::ApiError
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}/{}] {}", self.kind, code, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Lets handlers use `?` on local operations; the failure surfaces to the
/// peer as a `LocalError`.
impl From<WirelinkError> for RpcError {
    fn from(err: WirelinkError) -> Self {
        RpcError::local(err.to_string())
    }
}

/// Outcome of an API call: either the typed response or an [`RpcError`].
///
/// `call_api` resolves to this for every settled call; aborted calls
/// resolve to `None` at the `Option` layer above instead.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiReturn<T> {
    /// The call succeeded with a response value.
    Succ(T),
    /// The call failed; `err.kind` says who is to blame.
    Err(RpcError),
}

impl<T> ApiReturn<T> {
    /// True if this is a success.
    pub fn is_succ(&self) -> bool {
        matches!(self, ApiReturn::Succ(_))
    }

    /// True if this is an error.
    pub fn is_err(&self) -> bool {
        matches!(self, ApiReturn::Err(_))
    }

    /// The response value, if any.
    pub fn res(&self) -> Option<&T> {
        match self {
            ApiReturn::Succ(res) => Some(res),
            ApiReturn::Err(_) => None,
        }
    }

    /// The error, if any.
    pub fn err(&self) -> Option<&RpcError> {
        match self {
            ApiReturn::Succ(_) => None,
            ApiReturn::Err(err) => Some(err),
        }
    }

    /// Convert into a plain `Result`.
    pub fn into_result(self) -> Result<T, RpcError> {
        match self {
            ApiReturn::Succ(res) => Ok(res),
            ApiReturn::Err(err) => Err(err),
        }
    }

    /// Map the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiReturn<U> {
        match self {
            ApiReturn::Succ(res) => ApiReturn::Succ(f(res)),
            ApiReturn::Err(err) => ApiReturn::Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::timeout();
        assert_eq!(err.to_string(), "[NetworkError/TIMEOUT] Request Timeout");

        let err = RpcError::api("balance too low");
        assert_eq!(err.to_string(), "[ApiError] balance too low");
    }

    #[test]
    fn test_rpc_error_serde_roundtrip() {
        let err = RpcError::new(RpcErrorKind::ApiError, "nope")
            .with_code("NOPE")
            .with_prop("detail", serde_json::json!({"n": 1}));

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "ApiError");
        assert_eq!(json["code"], "NOPE");
        assert_eq!(json["detail"]["n"], 1);

        let back: RpcError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_rpc_error_code_omitted_when_none() {
        let json = serde_json::to_value(RpcError::local("oops")).unwrap();
        assert!(json.get("code").is_none());
    }

    #[test]
    fn test_well_known_errors() {
        let err = RpcError::lost_conn();
        assert_eq!(err.kind, RpcErrorKind::NetworkError);
        assert_eq!(err.code.as_deref(), Some(CODE_LOST_CONN));
        assert!(!err.is_api_error());
    }

    #[test]
    fn test_api_return_accessors() {
        let ok: ApiReturn<i32> = ApiReturn::Succ(7);
        assert!(ok.is_succ());
        assert_eq!(ok.res(), Some(&7));
        assert_eq!(ok.clone().into_result().unwrap(), 7);

        let err: ApiReturn<i32> = ApiReturn::Err(RpcError::timeout());
        assert!(err.is_err());
        assert!(err.res().is_none());
        assert_eq!(err.err().unwrap().code.as_deref(), Some(CODE_TIMEOUT));
    }

    #[test]
    fn test_api_return_map() {
        let ok: ApiReturn<i32> = ApiReturn::Succ(2);
        assert_eq!(ok.map(|n| n * 2), ApiReturn::Succ(4));
    }
}
