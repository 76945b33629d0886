//! Error taxonomy for the RPC runtime core.
//!
//! Mirrors the kinds enumerated in the design's error-handling section:
//! codec/protocol failures are local and drop or close the connection,
//! auth/dispatch failures are surfaced to the caller as a `Response`, and
//! transport/routing failures are distinguishable transient conditions so
//! callers can decide whether to retry.

use thiserror::Error;

/// Errors surfaced by the wire codec (C1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown message-type tag {0:#x}")]
    UnknownTag(u8),
    #[error("truncated message: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("missing required field {0} in message")]
    MissingField(&'static str),
    #[error("reference to unresolved id {0}")]
    UnresolvedReference(u32),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("field value out of range")]
    OutOfRange,
}

/// Errors surfaced by the PSK session/record layer (C2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown identity")]
    UnknownIdentity,
    #[error("challenge response did not match")]
    ChallengeMismatch,
    #[error("handshake did not complete within the configured timeout")]
    HandshakeTimeout,
    #[error("record rejected: too short or bad tag byte")]
    MalformedRecord,
    #[error("AEAD decryption failed")]
    DecryptFailed,
    #[error("replayed or too-old sequence number {seq} (watermark {watermark})")]
    ReplayDetected { seq: u64, watermark: u64 },
    #[error("operation invalid in session state {0:?}")]
    InvalidState(crate::session::SessionState),
}

/// Top-level error taxonomy (§7), used by endpoint and router code.
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] CodecError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("method not found: interface={interface} method_id={method_id}")]
    MethodNotFound { interface: String, method_id: i32 },
    #[error("invoker error: {0}")]
    InvokerError(String),
    #[error("request timed out")]
    RequestTimeout,
    #[error("request was cancelled")]
    Cancelled,
    #[error("transport disconnected")]
    TransportDisconnected,
    #[error("send buffer full")]
    SendBufferFull,
    #[error("mtu exceeded")]
    MtuExceeded,
    #[error("no servers available")]
    NoServersAvailable,
    #[error("replay detected")]
    ReplayDetected,
    #[error("decrypt failed")]
    DecryptFailed,
}

impl RpcError {
    /// True for errors the caller should treat as transient and may retry,
    /// as opposed to application-level rejections.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::NoServersAvailable
                | RpcError::TransportDisconnected
                | RpcError::SendBufferFull
        )
    }
}

impl From<SessionError> for RpcError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::UnknownIdentity | SessionError::ChallengeMismatch => {
                RpcError::HandshakeFailed(e.to_string())
            }
            SessionError::HandshakeTimeout => RpcError::HandshakeTimeout,
            SessionError::ReplayDetected { .. } => RpcError::ReplayDetected,
            SessionError::DecryptFailed | SessionError::MalformedRecord => RpcError::DecryptFailed,
            SessionError::InvalidState(_) => RpcError::ProtocolViolation(e.to_string()),
        }
    }
}
