//! Error types for the cluster crate.

use reef_types::InstanceId;

/// Errors produced by the registry.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The instance id is already registered from another endpoint.
    #[error("instance {id} is already registered at {existing}")]
    RegistryConflict {
        /// The contested instance id.
        id: InstanceId,
        /// Canonical endpoint of the entry already holding the id.
        existing: String,
    },
}
