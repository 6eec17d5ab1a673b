//! Cluster membership as seen by a tracker.
//!
//! This crate provides:
//!
//! - [`Registry`]: the table of registered instances with HOLD/FREE
//!   lifecycle, conflict detection and secret history.
//! - [`SweeperHandle`]: the background expiration sweep that reclaims
//!   released instances.

mod error;
mod registry;


pub use error::ClusterError;
pub use registry::{Registry, RegistryConfig, SweeperHandle};
