//! Error types for rpcwire.
//!
//! Two layers:
//! - [`RpcwireError`] - everything that can fail inside the crate (I/O,
//!   envelope encoding, framing, protocol state, stream lifecycle).
//! - [`RpcError`] - a protocol-level error with a kind and numeric code. This
//!   is what travels on the wire in `ret`/`func_ret` fields and CLOSE frames.

use std::fmt;

use thiserror::Error;

use crate::protocol::FrameError;

/// Numeric return codes carried on the wire.
pub mod codes {
    /// Success.
    pub const OK: i32 = 0;

    /// Server failed to decode the request.
    pub const SERVER_DECODE_FAIL: i32 = 1;
    /// Server failed to encode the response.
    pub const SERVER_ENCODE_FAIL: i32 = 2;
    /// No handler registered for the requested method.
    pub const SERVER_NO_FUNC: i32 = 12;
    /// Server-side processing timed out.
    pub const SERVER_TIMEOUT: i32 = 21;
    /// Server refused the request (too many in-flight handlers).
    pub const SERVER_OVERLOAD: i32 = 22;
    /// Unclassified server-side failure.
    pub const SERVER_SYSTEM_ERR: i32 = 31;
    /// Full-link timeout observed on the server.
    pub const SERVER_FULL_LINK_TIMEOUT: i32 = 24;

    /// Client call timed out.
    pub const CLIENT_INVOKE_TIMEOUT: i32 = 101;
    /// Client failed to encode the request.
    pub const CLIENT_ENCODE_FAIL: i32 = 121;
    /// Client failed to decode the response.
    pub const CLIENT_DECODE_FAIL: i32 = 122;
    /// Network failure on the client side.
    pub const CLIENT_NET_ERR: i32 = 141;
    /// Call canceled by the caller.
    pub const CLIENT_CANCELED: i32 = 161;
    /// Full-link timeout observed on the client.
    pub const CLIENT_FULL_LINK_TIMEOUT: i32 = 171;

    /// Server stream: the connection carrying the stream failed.
    pub const STREAM_SERVER_NETWORK_ERR: i32 = 201;
    /// Server stream: read side ended abnormally.
    pub const STREAM_SERVER_READ_END: i32 = 251;
    /// Server stream: receive timed out.
    pub const STREAM_SERVER_READ_TIMEOUT: i32 = 254;
    /// Client stream: the connection carrying the stream failed.
    pub const STREAM_CLIENT_NETWORK_ERR: i32 = 301;
    /// Client stream: read side ended abnormally.
    pub const STREAM_CLIENT_READ_END: i32 = 351;
    /// Client stream: receive timed out.
    pub const STREAM_CLIENT_READ_TIMEOUT: i32 = 354;

    /// Unknown error.
    pub const UNKNOWN: i32 = 999;
}

/// Which party produced an [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Raised by the local framework.
    Framework,
    /// Raised by application code (business return code).
    Business,
    /// Framework error reported by the remote peer.
    CalleeFramework,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Framework => "framework",
            ErrorKind::Business => "business",
            ErrorKind::CalleeFramework => "callee framework",
        };
        f.write_str(name)
    }
}

/// Protocol-level error carrying a kind, a numeric code and a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("type: {kind}, code: {code}, msg: {msg}")]
pub struct RpcError {
    /// Who raised it.
    pub kind: ErrorKind,
    /// Numeric return code (see [`codes`]).
    pub code: i32,
    /// Human readable message.
    pub msg: String,
}

impl RpcError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, code: i32, msg: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            msg: msg.into(),
        }
    }

    /// Local framework error.
    pub fn framework(code: i32, msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Framework, code, msg)
    }

    /// Application (business) error.
    pub fn business(code: i32, msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, code, msg)
    }

    /// Framework error reported by the peer.
    pub fn callee_framework(code: i32, msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::CalleeFramework, code, msg)
    }

    /// True for framework errors raised locally or by the peer.
    #[inline]
    pub fn is_framework(&self) -> bool {
        matches!(self.kind, ErrorKind::Framework | ErrorKind::CalleeFramework)
    }

    /// True if this error reports a timeout, by explicit code membership.
    ///
    /// Business errors never count as timeouts, whatever their code.
    pub fn is_timeout(&self) -> bool {
        if self.kind == ErrorKind::Business {
            return false;
        }
        matches!(
            self.code,
            codes::CLIENT_INVOKE_TIMEOUT
                | codes::CLIENT_FULL_LINK_TIMEOUT
                | codes::SERVER_TIMEOUT
                | codes::SERVER_FULL_LINK_TIMEOUT
                | codes::STREAM_SERVER_READ_TIMEOUT
                | codes::STREAM_CLIENT_READ_TIMEOUT
        )
    }
}

/// Main error type for all rpcwire operations.
#[derive(Debug, Error)]
pub enum RpcwireError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Frame could not be built or parsed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Protocol violation (unexpected frame, ID mismatch, bad lengths...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Protocol-level error with a return code.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A DATA/CLOSE/FEEDBACK frame arrived for a stream that never sent INIT.
    #[error("uninitialized metadata: addr {addr}, stream id {stream_id}")]
    UninitializedMeta {
        /// Remote address of the connection.
        addr: String,
        /// Stream identifier.
        stream_id: u32,
    },

    /// No stream is registered for this remote address.
    #[error("no such addr: {0}")]
    NoSuchAddr(String),

    /// The address is known but the stream ID is not.
    #[error("no such stream id: addr {addr}, stream id {stream_id}")]
    NoSuchStream {
        /// Remote address of the connection.
        addr: String,
        /// Stream identifier.
        stream_id: u32,
    },

    /// No handler registered for the method.
    #[error("handler not found for method: {0}")]
    HandlerNotFound(String),

    /// Operation on a stream that has already been closed.
    #[error("stream is already closed")]
    StreamClosed,

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Write queue stayed full past the configured timeout.
    #[error("backpressure timeout")]
    BackpressureTimeout,
}

impl RpcwireError {
    /// Convert into a wire-level error, keeping [`RpcError`]s as they are and
    /// wrapping anything else as a framework error with `code`.
    pub fn into_rpc(self, code: i32) -> RpcError {
        match self {
            RpcwireError::Rpc(err) => err,
            other => RpcError::framework(code, other.to_string()),
        }
    }

    /// Borrow the inner [`RpcError`], if any.
    pub fn as_rpc(&self) -> Option<&RpcError> {
        match self {
            RpcwireError::Rpc(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias using RpcwireError.
pub type Result<T> = std::result::Result<T, RpcwireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::framework(codes::SERVER_NO_FUNC, "no such method");
        assert_eq!(
            err.to_string(),
            "type: framework, code: 12, msg: no such method"
        );
    }

    #[test]
    fn test_is_timeout_by_code() {
        assert!(RpcError::framework(codes::CLIENT_INVOKE_TIMEOUT, "").is_timeout());
        assert!(RpcError::callee_framework(codes::SERVER_TIMEOUT, "").is_timeout());
        assert!(!RpcError::framework(codes::CLIENT_CANCELED, "").is_timeout());
        // Business codes are application defined and never classified.
        assert!(!RpcError::business(codes::CLIENT_INVOKE_TIMEOUT, "").is_timeout());
    }

    #[test]
    fn test_is_framework() {
        assert!(RpcError::framework(1, "").is_framework());
        assert!(RpcError::callee_framework(1, "").is_framework());
        assert!(!RpcError::business(1, "").is_framework());
    }

    #[test]
    fn test_into_rpc_keeps_rpc_errors() {
        let err = RpcwireError::Rpc(RpcError::business(7, "bad input"));
        assert_eq!(err.into_rpc(codes::UNKNOWN), RpcError::business(7, "bad input"));

        let wrapped = RpcwireError::StreamClosed.into_rpc(codes::STREAM_CLIENT_READ_END);
        assert_eq!(wrapped.kind, ErrorKind::Framework);
        assert_eq!(wrapped.code, codes::STREAM_CLIENT_READ_END);
        assert_eq!(wrapped.msg, "stream is already closed");
    }
}
