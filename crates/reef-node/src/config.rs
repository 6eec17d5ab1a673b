//! Runtime configuration for tracker and storage nodes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reef_cluster::RegistryConfig;
use reef_net::{DEFAULT_BUFFER_SIZE, PoolConfig};
use reef_worker::WorkerConfig;

/// Configuration for a tracker node.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Cluster secret every connection must present.
    pub secret: String,
    /// Registry expiration tuning.
    pub registry: RegistryConfig,
    /// Connection worker limits.
    pub worker: WorkerConfig,
}

impl TrackerConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            registry: RegistryConfig::test_config(),
            worker: WorkerConfig::test_config(),
        }
    }

    /// Create a default config for production use.
    pub fn default_config(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            registry: RegistryConfig::default_config(),
            worker: WorkerConfig::default_config(),
        }
    }
}

/// Configuration for a storage node.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Cluster secret.
    pub secret: String,
    /// Replication group.
    pub group: String,
    /// Root of the object store, metadata store and instance id.
    pub data_dir: PathBuf,
    /// Address advertised to other members. `None` lets the tracker use the
    /// address it observes.
    pub advertise_host: Option<String>,
    /// Trackers as `host:port`.
    pub trackers: Vec<String>,
    /// Period of the registration heartbeat.
    pub heartbeat_interval: Duration,
    /// Period of the catalog sync.
    pub sync_interval: Duration,
    /// Chunk size for body transfers.
    pub buffer_size: usize,
    /// Outbound connection limits.
    pub pool: PoolConfig,
    /// Connection worker limits.
    pub worker: WorkerConfig,
}

impl StorageConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config(secret: &str, data_dir: &Path, trackers: Vec<String>) -> Self {
        Self {
            secret: secret.to_string(),
            group: "group1".to_string(),
            data_dir: data_dir.to_path_buf(),
            advertise_host: None,
            trackers,
            heartbeat_interval: Duration::from_millis(50),
            sync_interval: Duration::from_millis(50),
            buffer_size: 1024,
            pool: PoolConfig::test_config(),
            worker: WorkerConfig::test_config(),
        }
    }

    /// Create a default config for production use.
    pub fn default_config(secret: &str, data_dir: &Path, trackers: Vec<String>) -> Self {
        Self {
            secret: secret.to_string(),
            group: "group1".to_string(),
            data_dir: data_dir.to_path_buf(),
            advertise_host: None,
            trackers,
            heartbeat_interval: Duration::from_secs(10),
            sync_interval: Duration::from_secs(5),
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool: PoolConfig::default_config(),
            worker: WorkerConfig::default_config(),
        }
    }

    /// Directory holding stored objects.
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// Directory holding the metadata store.
    pub fn meta_dir(&self) -> PathBuf {
        self.data_dir.join("meta")
    }
}
