//! Shared test harness for Reef integration tests.
//!
//! Provides [`ReefCluster`]: one tracker and N storage nodes running
//! in-process on loopback TCP with test timings, plus a client to drive
//! them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reef_meta::MetaStore;
use reef_net::{ConnectionPool, PoolConfig};
use reef_node::{Client, StorageConfig, StorageHandle, StorageNode, TrackerConfig, TrackerNode};
use reef_types::{Digest, InstanceId, InstanceState, ServerEndpoint};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time;

/// Cluster secret used by every node and the test client.
pub const SECRET: &str = "integration-secret";

/// One storage node slot. The data directory outlives a stop.
struct StorageSlot {
    _dir: TempDir,
    handle: Option<StorageHandle>,
}

/// A tracker plus storage nodes, all in this process.
pub struct ReefCluster {
    tracker: TrackerNode,
    storages: Vec<StorageSlot>,
    client: Client,
}

impl ReefCluster {
    /// Start a tracker and `storage_count` storage nodes.
    pub async fn new(storage_count: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let meta = Arc::new(MetaStore::open_temporary().unwrap());
        let tracker = TrackerNode::start(TrackerConfig::test_config(SECRET), listener, meta).unwrap();

        let client = Client::new(Arc::new(ConnectionPool::new(PoolConfig::test_config())), 4096);
        let mut cluster = Self {
            tracker,
            storages: Vec::new(),
            client,
        };
        for _ in 0..storage_count {
            cluster.add_storage().await;
        }
        cluster
    }

    /// Start one more storage node. Returns its index.
    pub async fn add_storage(&mut self) -> usize {
        let dir = tempfile::tempdir().unwrap();
        let handle = self.start_storage_in(&dir).await;
        self.storages.push(StorageSlot {
            _dir: dir,
            handle: Some(handle),
        });
        self.storages.len() - 1
    }

    async fn start_storage_in(&self, dir: &TempDir) -> StorageHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = StorageConfig::test_config(
            SECRET,
            dir.path(),
            vec![self.tracker.local_addr().to_string()],
        );
        let node = StorageNode::open(config, listener.local_addr().unwrap()).unwrap();
        StorageHandle::start(Arc::new(node), listener).unwrap()
    }

    /// Stop storage node `i`, keeping its data directory.
    pub async fn stop_storage(&mut self, i: usize) {
        if let Some(handle) = self.storages[i].handle.take() {
            handle.shutdown().await;
        }
    }

    /// The tracker.
    pub fn tracker(&self) -> &TrackerNode {
        &self.tracker
    }

    /// Running storage node `i`.
    pub fn storage(&self, i: usize) -> &StorageHandle {
        self.storages[i]
            .handle
            .as_ref()
            .unwrap_or_else(|| panic!("storage {i} is stopped"))
    }

    /// Identity of storage node `i`.
    pub fn storage_id(&self, i: usize) -> InstanceId {
        self.storage(i).node().id().clone()
    }

    /// Number of storage slots (running or stopped).
    pub fn len(&self) -> usize {
        self.storages.len()
    }

    /// Whether there are no storage slots.
    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    /// Endpoint of storage node `i`.
    pub fn storage_endpoint(&self, i: usize) -> ServerEndpoint {
        endpoint(self.storage(i).local_addr())
    }

    /// Endpoint of the tracker.
    pub fn tracker_endpoint(&self) -> ServerEndpoint {
        endpoint(self.tracker.local_addr()).tracker()
    }

    /// Test client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Upload `data` to storage node `i`. Returns the stored path.
    pub async fn upload(&self, i: usize, data: &[u8], ext: &str) -> String {
        self.client
            .upload(
                &self.storage_endpoint(i),
                &mut &data[..],
                data.len() as u64,
                ext,
                Some(Digest::from_data(data)),
            )
            .await
            .unwrap()
    }

    /// Download `path` from storage node `i`.
    pub async fn download(&self, i: usize, path: &str) -> Vec<u8> {
        let mut out = Vec::new();
        self.client
            .download(&self.storage_endpoint(i), path, &mut out)
            .await
            .unwrap();
        out
    }

    /// Wait until storage node `i` holds a live registration.
    pub async fn wait_registered(&self, i: usize) {
        let registry = self.tracker.registry().clone();
        let id = self.storage_id(i);
        wait_for(Duration::from_secs(5), Duration::from_millis(10), || {
            let registry = registry.clone();
            let id = id.clone();
            async move {
                registry
                    .get(&id)
                    .await
                    .is_some_and(|i| i.state == InstanceState::Hold)
            }
        })
        .await;
    }

    /// Wait until storage node `i` stores `digest`.
    pub async fn wait_replicated(&self, i: usize, digest: Digest) {
        let node = self.storage(i).node().clone();
        wait_for(Duration::from_secs(5), Duration::from_millis(20), || {
            let node = node.clone();
            async move { node.store().contains(&digest).await.unwrap() }
        })
        .await;
    }

    /// Stop every node.
    pub async fn shutdown(self) {
        for slot in self.storages {
            if let Some(handle) = slot.handle {
                handle.shutdown().await;
            }
        }
        self.tracker.shutdown().await;
    }
}

fn endpoint(addr: SocketAddr) -> ServerEndpoint {
    ServerEndpoint::new(&addr.ip().to_string(), addr.port(), SECRET)
}

/// Wait for a condition to become true within a timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, poll_interval: Duration, condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        time::sleep(poll_interval).await;
    }
}

/// Generate deterministic test data of the given size.
pub fn test_data(size: usize) -> Vec<u8> {
    test_data_seeded(size, 42)
}

/// Generate deterministic test data with a custom seed.
pub fn test_data_seeded(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = seed;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}
