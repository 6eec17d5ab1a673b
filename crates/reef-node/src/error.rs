//! Error types for node services.

use reef_cluster::ClusterError;
use reef_meta::MetaError;
use reef_net::NetError;
use reef_store::StoreError;
use reef_worker::WorkerError;

/// Errors surfaced by node services and background jobs.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Wire protocol or outbound connection failure.
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// Object store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Metadata store failure.
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),

    /// Registry failure.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Worker pool refused a task.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Local I/O failure outside the object store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A configured address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}
