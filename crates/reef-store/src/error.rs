//! Error types for object storage operations.

use reef_net::NetError;
use reef_types::Digest;

/// Errors that can occur while placing or reading stored objects.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// The incoming body could not be read in full.
    #[error("transfer failed: {0}")]
    Transfer(#[from] NetError),

    /// The received content does not hash to the digest the sender declared.
    #[error("digest mismatch: expected {expected}, received {actual}")]
    DigestMismatch {
        /// Digest declared by the sender.
        expected: Digest,
        /// Digest of the bytes actually received.
        actual: Digest,
    },

    /// A path or digest string that does not name an object.
    #[error("invalid object path: {0}")]
    InvalidPath(String),
}
