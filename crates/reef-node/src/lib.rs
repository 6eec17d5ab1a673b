//! Tracker and storage node services.
//!
//! This crate wires the wire codec, object store, registry and worker pool
//! into running nodes:
//!
//! - [`serve`]: the accept loop, one worker-pool task per connection.
//! - [`TrackerService`] / [`TrackerNode`]: registration with heartbeat
//!   release, the file catalog and catalog pulls.
//! - [`StorageNode`] / [`StorageHandle`]: uploads, downloads and queries,
//!   plus the heartbeat and sync background jobs.
//! - [`Client`]: outbound calls over a [`ConnectionPool`](reef_net::ConnectionPool).

pub mod client;
pub mod config;
mod error;
pub mod jobs;
pub mod server;
pub mod storage;
#[cfg(test)]
mod tests;
pub mod tracker;

pub use client::Client;
pub use config::{StorageConfig, TrackerConfig};
pub use error::NodeError;
pub use jobs::JobsHandle;
pub use server::{ConnectionHandler, ServerHandle, serve, spawn_server};
pub use storage::{INSTANCE_ID_FILE, StorageHandle, StorageNode, load_or_create_instance_id};
pub use tracker::{TrackerNode, TrackerService};
