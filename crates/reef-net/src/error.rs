//! Error types for network operations.

use crate::message::Status;

/// Errors that can occur during network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Short read, length mismatch, unsupported opcode or undecodable meta.
    ///
    /// The connection must be closed; the codec never retries.
    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),

    /// The destination is at its connection cap with nothing idle.
    #[error("connection pool exhausted for {endpoint} ({max} active)")]
    PoolExhausted {
        /// Canonical endpoint key.
        endpoint: String,
        /// Configured per-destination maximum.
        max: usize,
    },

    /// Failed to connect to a remote endpoint.
    #[error("connect to {endpoint} failed: {reason}")]
    Connect {
        /// Canonical address that was dialed.
        endpoint: String,
        /// Underlying failure.
        reason: String,
    },

    /// Dialing or validating a connection took longer than the dial timeout.
    #[error("dial to {0} timed out")]
    Timeout(String),

    /// The remote rejected our secret during connection validation.
    #[error("secret rejected by {0}")]
    BadSecret(String),

    /// The remote answered with a non-OK status.
    #[error("remote returned status {0:?}")]
    Status(Status),

    /// A response frame arrived where something else was expected.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Meta record serialization failed on the sending side.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An I/O error on the socket or the local sink.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Whether the error came from reaching the peer at all, as opposed to
    /// the peer answering badly. Only these trigger address failover.
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            NetError::Connect { .. } | NetError::Timeout(_) | NetError::Io(_)
        )
    }

    /// Whether the connection that produced this error may be reused.
    ///
    /// A non-OK status is a well-formed exchange; everything else leaves the
    /// stream in an unknown position.
    pub fn connection_reusable(&self) -> bool {
        matches!(self, NetError::Status(_))
    }
}
