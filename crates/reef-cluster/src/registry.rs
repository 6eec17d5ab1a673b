//! Instance registry and expiration sweep.
//!
//! Every mutation and the sweep go through one `tokio::sync::Mutex`, so
//! registry state changes are totally ordered. Callers only ever receive
//! clones of the stored entries.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use reef_meta::MetaStore;
use reef_types::{Instance, InstanceId, InstanceRole, InstanceState, now_nanos};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::ClusterError;

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a FREE instance survives before the sweep removes it. Also
    /// the sweep period.
    pub expiration: Duration,
}

impl RegistryConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            expiration: Duration::from_millis(100),
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            expiration: Duration::from_secs(30),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Table of registered instances.
pub struct Registry {
    config: RegistryConfig,
    instances: Mutex<HashMap<InstanceId, Instance>>,
    meta: Option<Arc<MetaStore>>,
}

impl Registry {
    /// Create an empty registry. With a metadata store, storage instances'
    /// secrets are persisted on registration.
    pub fn new(config: RegistryConfig, meta: Option<Arc<MetaStore>>) -> Self {
        Self {
            config,
            instances: Mutex::new(HashMap::new()),
            meta,
        }
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register or refresh an instance.
    ///
    /// Fails if another entry holds the same id on a different endpoint.
    /// On success the stored entry is HOLD with a fresh timestamp; a copy is
    /// returned.
    pub async fn put(&self, mut instance: Instance) -> Result<Instance, ClusterError> {
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&instance.id)
            && existing.conflicts_with(&instance)
        {
            let existing = existing.endpoint();
            warn!(id = %instance.id, %existing, attempted = %instance.endpoint(), "registration conflict");
            return Err(ClusterError::RegistryConflict {
                id: instance.id.clone(),
                existing,
            });
        }

        // Stamped under the lock so timestamps follow the mutation order.
        instance.state = InstanceState::Hold;
        instance.updated_at = now_nanos();
        let fresh = !instances.contains_key(&instance.id);
        instances.insert(instance.id.clone(), instance.clone());
        if fresh {
            info!(id = %instance.id, role = ?instance.role, group = %instance.group, endpoint = %instance.endpoint(), "instance registered");
        } else {
            debug!(id = %instance.id, "instance refreshed");
        }

        // The secret history is written in registry order.
        if instance.role == InstanceRole::Storage
            && let Some(meta) = &self.meta
            && let Err(e) = meta.record_secret(&instance.id, &instance.secret)
        {
            error!(id = %instance.id, error = %e, "failed to persist secret history");
        }

        Ok(instance)
    }

    /// Mark an instance releasable and restart its expiration clock.
    ///
    /// Unknown ids are ignored.
    pub async fn free(&self, id: &InstanceId) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.state = InstanceState::Free;
            instance.updated_at = now_nanos();
            debug!(%id, "instance freed");
        }
    }

    /// Remove an instance immediately.
    pub async fn remove(&self, id: &InstanceId) -> Option<Instance> {
        let removed = self.instances.lock().await.remove(id);
        if removed.is_some() {
            info!(%id, "instance removed");
        }
        removed
    }

    /// Copy of every entry.
    pub async fn snapshot(&self) -> Vec<Instance> {
        self.instances.lock().await.values().cloned().collect()
    }

    /// Copy of one entry.
    pub async fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.instances.lock().await.get(id).cloned()
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.instances.lock().await.is_empty()
    }

    /// Entries with the given role and group.
    pub async fn group_members(&self, role: InstanceRole, group: &str) -> Vec<Instance> {
        self.instances
            .lock()
            .await
            .values()
            .filter(|i| i.role == role && i.group == group)
            .cloned()
            .collect()
    }

    /// Secrets a storage instance has registered with, most recent last.
    ///
    /// Empty without a metadata store or on read failure.
    pub fn known_secrets(&self, id: &InstanceId) -> Vec<String> {
        let Some(meta) = &self.meta else {
            return Vec::new();
        };
        match meta.known_secrets(id) {
            Ok(secrets) => secrets,
            Err(e) => {
                error!(%id, error = %e, "failed to read secret history");
                Vec::new()
            }
        }
    }

    /// Remove FREE entries whose last update is older than the expiration
    /// window.
    pub async fn sweep(&self) -> Vec<InstanceId> {
        self.sweep_at(now_nanos()).await
    }

    /// [`sweep`](Self::sweep) against an explicit clock reading.
    pub async fn sweep_at(&self, now: u64) -> Vec<InstanceId> {
        let window = u64::try_from(self.config.expiration.as_nanos()).unwrap_or(u64::MAX);
        let cutoff = now.saturating_sub(window);

        let mut instances = self.instances.lock().await;
        let expired: Vec<InstanceId> = instances
            .values()
            .filter(|i| i.state == InstanceState::Free && i.updated_at < cutoff)
            .map(|i| i.id.clone())
            .collect();
        for id in &expired {
            instances.remove(id);
            debug!(%id, "expired instance reclaimed");
        }
        expired
    }

    /// Start the periodic expiration sweep.
    ///
    /// The job runs every expiration window and holds only a weak reference
    /// to the registry, so it ends by itself once the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let registry: Weak<Registry> = Arc::downgrade(self);
        let period = self.config.expiration;

        let task = tokio::spawn(async move {
            debug!(?period, "registry sweeper started");
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        let expired = registry.sweep().await;
                        if !expired.is_empty() {
                            debug!(count = expired.len(), "sweep removed expired instances");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("registry sweeper stopped");
        });

        SweeperHandle { shutdown_tx, task }
    }
}

/// Handle to a running expiration sweep.
pub struct SweeperHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweep to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }

    /// Abort the background task.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Check whether the background task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
