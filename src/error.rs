//! # Error Taxonomy
//!
//! A single typed error enum shared by every layer of the engine: address
//! parsing, connections, the pool, the breaker, the scheduler, and protocol
//! handlers. Keeping one enum (rather than one per module) lets the breaker
//! and the handler retry loop share a single classification instead of each
//! re-deriving "is this retryable" / "does this count against the breaker"
//! at its own call sites.

use std::fmt;
use thiserror::Error;

/// Further classification of a wire-level protocol exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Transient condition (e.g. device busy); the caller's retry loop
    /// should try again.
    Recoverable,
    /// Permanent condition (e.g. object does not exist); surfaced
    /// immediately with no retry.
    Permanent,
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolErrorKind::Recoverable => write!(f, "recoverable"),
            ProtocolErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// The complete error taxonomy for the device-session and I/O engine.
///
/// Variant names match the error *kinds* in the specification verbatim so
/// that logs, diagnostics ring buffers, and HTTP status mapping (a
/// front-end concern, not implemented here) can all key off one vocabulary.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Address failed protocol-specific parsing. Never retried.
    #[error("invalid address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Write targeted a non-writable table or a read-only node. Never retried.
    #[error("address `{address}` is not writable")]
    UnwritableAddress { address: String },

    /// Write value cannot be encoded as the tag's declared type. Never retried.
    #[error("value cannot be encoded as `{data_type}`: {reason}")]
    TypeMismatch { data_type: String, reason: String },

    /// Deadline exceeded at any layer (pool, breaker, wire op). Retryable
    /// by the caller, not retried internally.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Socket-level failure. Closes the connection; counts against the breaker.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Protocol session invalidated (CIP session rejected, OPC-UA channel
    /// dropped). Triggers reconnect on the next operation, not synchronously.
    #[error("session lost: {0}")]
    SessionLost(String),

    /// Wire-level exception response, classified recoverable vs. permanent.
    #[error("protocol error ({kind}): {message}")]
    ProtocolError {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// The device's circuit breaker is open; no attempt was made.
    #[error("circuit breaker open for device `{device_id}`")]
    BreakerOpen { device_id: String },

    /// Backpressure: a scheduler queue was full.
    #[error("queue full for device `{device_id}`")]
    QueueFull { device_id: String },

    /// No pool connection became available within the acquire timeout.
    #[error("pool exhausted for device `{device_id}`")]
    PoolExhausted { device_id: String },

    /// The pool's connection factory failed to establish a new connection.
    #[error("connection factory failed for device `{device_id}`: {reason}")]
    FactoryFailed { device_id: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Whether a caller-visible retry (handler-level `retry_count`) should
    /// be attempted for this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Timeout(_) => true,
            GatewayError::TransportError(_) => true,
            GatewayError::SessionLost(_) => true,
            GatewayError::ProtocolError { kind, .. } => *kind == ProtocolErrorKind::Recoverable,
            GatewayError::Io(_) => true,
            GatewayError::InvalidAddress { .. }
            | GatewayError::UnwritableAddress { .. }
            | GatewayError::TypeMismatch { .. }
            | GatewayError::BreakerOpen { .. }
            | GatewayError::QueueFull { .. }
            | GatewayError::PoolExhausted { .. }
            | GatewayError::FactoryFailed { .. }
            | GatewayError::Other(_) => false,
        }
    }

    /// Whether this error should count as a failure in the circuit
    /// breaker's rolling window. Per spec §4.4/§7: transport/session
    /// failures and factory failures count; address/type errors and
    /// permanent protocol errors never do, and recoverable protocol errors
    /// (e.g. device busy) do not either, since they are not indicative of
    /// the device being unreachable.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            GatewayError::TransportError(_)
                | GatewayError::SessionLost(_)
                | GatewayError::FactoryFailed { .. }
                | GatewayError::Timeout(_)
                | GatewayError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_and_type_errors_never_retry_or_trip_breaker() {
        let e = GatewayError::InvalidAddress {
            address: "xx".into(),
            reason: "bad".into(),
        };
        assert!(!e.is_retryable());
        assert!(!e.counts_against_breaker());
    }

    #[test]
    fn permanent_protocol_errors_do_not_retry_or_trip_breaker() {
        let e = GatewayError::ProtocolError {
            kind: ProtocolErrorKind::Permanent,
            message: "illegal-data-address".into(),
        };
        assert!(!e.is_retryable());
        assert!(!e.counts_against_breaker());
    }

    #[test]
    fn recoverable_protocol_errors_retry_but_do_not_trip_breaker() {
        let e = GatewayError::ProtocolError {
            kind: ProtocolErrorKind::Recoverable,
            message: "device busy".into(),
        };
        assert!(e.is_retryable());
        assert!(!e.counts_against_breaker());
    }

    #[test]
    fn transport_errors_retry_and_trip_breaker() {
        let e = GatewayError::TransportError("reset by peer".into());
        assert!(e.is_retryable());
        assert!(e.counts_against_breaker());
    }
}
