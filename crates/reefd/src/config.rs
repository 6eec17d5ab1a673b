//! TOML configuration for the Reef daemon.
//!
//! Every section is optional; missing sections and keys take the defaults
//! below. Command-line flags override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reef_cluster::RegistryConfig;
use reef_net::{DEFAULT_BUFFER_SIZE, PoolConfig};
use reef_node::{StorageConfig, TrackerConfig};
use reef_worker::WorkerConfig;
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Local data location.
    pub node: NodeSection,
    /// Cluster-wide settings.
    pub cluster: ClusterSection,
    /// Tracker role.
    pub tracker: TrackerSection,
    /// Storage role.
    pub storage: StorageSection,
    /// Outbound connection pool.
    pub pool: PoolSection,
    /// Connection worker pool.
    pub worker: WorkerSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for persistent data (metadata DB, objects, instance id).
    pub data_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".reef"))
            .unwrap_or_else(|| PathBuf::from(".reef"));
        Self { data_dir }
    }
}

/// `[cluster]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Shared secret every node and client presents.
    ///
    /// A tracker started without one generates a random secret and logs it.
    pub secret: String,
}

/// `[tracker]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    /// Address the tracker listens on.
    pub listen_addr: String,
    /// Seconds a released storage registration is kept before it is swept.
    pub expiration_secs: u64,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:22122".to_string(),
            expiration_secs: 30,
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Address the storage node listens on.
    pub listen_addr: String,
    /// Address advertised to other storage nodes, for NAT setups.
    pub advertise_addr: Option<String>,
    /// Replication group.
    pub group: String,
    /// Trackers as `host:port`.
    pub trackers: Vec<String>,
    /// Seconds between registration heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Seconds between catalog sync rounds.
    pub sync_interval_secs: u64,
    /// Chunk size in bytes for body transfers.
    pub buffer_size: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:23000".to_string(),
            advertise_addr: None,
            group: "group1".to_string(),
            trackers: Vec::new(),
            heartbeat_interval_secs: 10,
            sync_interval_secs: 5,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// `[pool]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Maximum open connections per destination.
    pub max_per_endpoint: usize,
    /// Milliseconds allowed for dialing and validating a connection.
    pub dial_timeout_ms: u64,
    /// Seconds an idle connection may sit in the pool.
    pub idle_ttl_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        let defaults = PoolConfig::default_config();
        Self {
            max_per_endpoint: defaults.max_per_endpoint,
            dial_timeout_ms: defaults.dial_timeout.as_millis() as u64,
            idle_ttl_secs: defaults.idle_ttl.as_secs(),
        }
    }
}

/// `[worker]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Maximum connections served at once.
    pub ceiling: usize,
    /// Maximum connections waiting for a worker.
    pub queue_size: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let defaults = WorkerConfig::default_config();
        Self {
            ceiling: defaults.ceiling,
            queue_size: defaults.queue_size,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                config.validate()?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        let config: CliConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values a node cannot run with.
    fn validate(&self) -> anyhow::Result<()> {
        if self.worker.ceiling == 0 {
            anyhow::bail!("[worker] ceiling must be at least 1");
        }
        if self.pool.max_per_endpoint == 0 {
            anyhow::bail!("[pool] max_per_endpoint must be at least 1");
        }
        Ok(())
    }

    /// Effective pool configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_per_endpoint: self.pool.max_per_endpoint,
            dial_timeout: Duration::from_millis(self.pool.dial_timeout_ms),
            idle_ttl: Duration::from_secs(self.pool.idle_ttl_secs),
        }
    }

    /// Effective worker configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            ceiling: self.worker.ceiling,
            queue_size: self.worker.queue_size,
        }
    }

    /// Runtime configuration for a tracker node.
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            secret: self.cluster.secret.clone(),
            registry: RegistryConfig {
                expiration: Duration::from_secs(self.tracker.expiration_secs),
            },
            worker: self.worker_config(),
        }
    }

    /// Runtime configuration for a storage node.
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            secret: self.cluster.secret.clone(),
            group: self.storage.group.clone(),
            data_dir: self.node.data_dir.clone(),
            advertise_host: self.storage.advertise_addr.clone(),
            trackers: self.storage.trackers.clone(),
            heartbeat_interval: Duration::from_secs(self.storage.heartbeat_interval_secs),
            sync_interval: Duration::from_secs(self.storage.sync_interval_secs),
            buffer_size: self.storage.buffer_size,
            pool: self.pool_config(),
            worker: self.worker_config(),
        }
    }
}
