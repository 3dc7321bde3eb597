//! Error types for callwire.
//!
//! Errors cross the wire as their display string. [`RpcError::from_wire`]
//! restores the kinds a caller is expected to match on.

use thiserror::Error;

/// Main error type for all callwire operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Protocol error (bad message id, type mismatch, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No function is registered under the requested method name.
    #[error("function not found")]
    FunctionNotFound,

    /// The function expects a request value but none was sent.
    #[error("missing input parameter")]
    MissingInputParameter,

    /// The handler panicked. Details are only logged on the serving side.
    #[error("invocation failed")]
    InvocationFailed,

    /// No response arrived within the call timeout.
    #[error("call timed out")]
    Timeout,

    /// The callable (or its core) is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Write buffer full for longer than the backpressure timeout.
    #[error("backpressure timeout")]
    BackpressureTimeout,

    /// A function could not be registered.
    #[error("registration error: {0}")]
    Registration(String),

    /// Error raised by application code (handlers, middleware).
    #[error("{0}")]
    Custom(String),

    /// Error reported by the peer that has no dedicated kind.
    #[error("{0}")]
    Remote(String),

    /// Several errors that happened on the same call.
    #[error("{}", join_errors(.0))]
    Combined(Vec<RpcError>),
}

fn join_errors(errors: &[RpcError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl RpcError {
    /// Build an application error from a message.
    pub fn custom(msg: impl Into<String>) -> Self {
        RpcError::Custom(msg.into())
    }

    /// Map an error string received in a response back to an error kind.
    pub fn from_wire(msg: String) -> Self {
        match msg.as_str() {
            "function not found" => RpcError::FunctionNotFound,
            "missing input parameter" => RpcError::MissingInputParameter,
            "invocation failed" => RpcError::InvocationFailed,
            "call timed out" => RpcError::Timeout,
            "connection closed" => RpcError::ConnectionClosed,
            _ => RpcError::Remote(msg),
        }
    }

    /// Combine two errors without losing either one.
    pub fn combine(self, other: RpcError) -> Self {
        let mut errors = match self {
            RpcError::Combined(errors) => errors,
            e => vec![e],
        };
        match other {
            RpcError::Combined(more) => errors.extend(more),
            e => errors.push(e),
        }
        RpcError::Combined(errors)
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip_of_surfaced_kinds() {
        for err in [
            RpcError::FunctionNotFound,
            RpcError::MissingInputParameter,
            RpcError::InvocationFailed,
            RpcError::Timeout,
            RpcError::ConnectionClosed,
        ] {
            let back = RpcError::from_wire(err.to_string());
            assert_eq!(back.to_string(), err.to_string());
            assert!(!matches!(back, RpcError::Remote(_)));
        }
    }

    #[test]
    fn test_unknown_wire_error_is_remote() {
        let err = RpcError::from_wire("disk full".to_string());
        assert!(matches!(err, RpcError::Remote(ref m) if m == "disk full"));
    }

    #[test]
    fn test_combine_flattens() {
        let err = RpcError::Timeout
            .combine(RpcError::custom("a"))
            .combine(RpcError::Combined(vec![RpcError::custom("b")]));

        match &err {
            RpcError::Combined(errors) => assert_eq!(errors.len(), 3),
            other => panic!("expected combined, got {other:?}"),
        }
        assert_eq!(err.to_string(), "call timed out; a; b");
    }
}
