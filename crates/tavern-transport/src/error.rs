//! Transport error taxonomy.

use thiserror::Error;

/// Connection-level error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The physical link could not be opened (refused, unreachable, or the
    /// handshake did not finish within the connect timeout).
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("Channel driver has stopped")]
    DriverStopped,
}

/// Failure of a correlated request.
///
/// Every request settles exactly once: with the response payload or with one
/// of these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Request {id} ({kind}) timed out after {timeout_ms}ms")]
    Timeout {
        id: String,
        kind: String,
        timeout_ms: u64,
    },
    #[error("Connection closed before a response arrived")]
    ConnectionClosed,
    /// The matching response carried an `error` field.
    #[error("Remote error: {0}")]
    Remote(String),
}

/// Outbound queue error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Outbound queue full ({capacity} messages); message dropped")]
    Overflow { capacity: usize },
}

/// Wire protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
