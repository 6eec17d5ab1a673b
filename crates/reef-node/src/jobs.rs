//! Storage node background jobs: the registration heartbeat and the
//! catalog sync.

use std::sync::{Arc, Weak};
use std::time::Duration;

use reef_net::message::RegisterStorageRequest;
use reef_net::{NetError, Status};
use reef_store::Placement;
use reef_types::ServerEndpoint;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::storage::StorageNode;

/// Start the heartbeat and sync jobs for `node`.
///
/// The jobs hold weak references and end on their own once the node is
/// dropped.
pub fn spawn(node: &Arc<StorageNode>) -> JobsHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = node.config();

    let heartbeat_task = spawn_periodic(
        "heartbeat",
        Arc::downgrade(node),
        config.heartbeat_interval,
        shutdown_rx.clone(),
        |node| async move {
            heartbeat(&node).await;
        },
    );
    let sync_task = spawn_periodic(
        "sync",
        Arc::downgrade(node),
        config.sync_interval,
        shutdown_rx,
        |node| async move {
            for tracker in node.trackers() {
                match sync_from(&node, tracker).await {
                    Ok(0) => {}
                    Ok(count) => debug!(%tracker, count, "sync round advanced"),
                    Err(e) => warn!(%tracker, error = %e, "sync round failed"),
                }
            }
        },
    );

    JobsHandle {
        shutdown_tx,
        tasks: vec![heartbeat_task, sync_task],
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    node: Weak<StorageNode>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    round: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<StorageNode>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        debug!(job = name, ?period, "background job started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(node) = node.upgrade() else {
                        break;
                    };
                    round(node).await;
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!(job = name, "background job stopped");
    })
}

/// Register with every tracker and remember the returned group members.
///
/// The pooled connection stays open after the exchange, which keeps this
/// node in HOLD on the tracker.
pub async fn heartbeat(node: &StorageNode) {
    let (bind_host, port) = node.bind_addr();
    let config = node.config();
    let request = RegisterStorageRequest {
        secret: config.secret.clone(),
        bind_addr: bind_host.to_string(),
        advertise_addr: config.advertise_host.clone().unwrap_or_default(),
        group: config.group.clone(),
        instance_id: node.id().clone(),
        port,
    };

    for tracker in node.trackers() {
        match node.client().register_storage(tracker, request.clone()).await {
            Ok(response) => {
                debug!(%tracker, look_back = %response.look_back_addr, members = response.group_members.len(), "heartbeat ok");
                node.set_members(response.group_members);
            }
            Err(NetError::Status(Status::InstanceConflict)) => {
                warn!(%tracker, id = %node.id(), "instance id is registered from another endpoint");
            }
            Err(e) => warn!(%tracker, error = %e, "heartbeat failed"),
        }
    }
}

/// Catalog cursor key for one tracker.
pub fn cursor_name(tracker: &ServerEndpoint) -> String {
    format!("sync:{}", tracker.canonical())
}

/// Pull catalog entries from `tracker` until caught up, replicating files
/// this node does not hold. Returns how many entries the cursor advanced.
///
/// A file that cannot be fetched yet (owner unknown or unreachable) ends
/// the round without advancing past it, so it is retried next round.
pub async fn sync_from(node: &StorageNode, tracker: &ServerEndpoint) -> Result<usize, NodeError> {
    let name = cursor_name(tracker);
    let mut cursor = node.meta().get_cursor(&name)?;
    let mut advanced = 0;

    while let Some(file) = node.client().sync_pull(tracker, cursor).await? {
        if file.instance != *node.id() && !node.store().contains(&file.md5).await? {
            let Some(owner) = node.member_endpoint(&file.instance) else {
                debug!(md5 = %file.md5, owner = %file.instance, "owner not known yet, retrying later");
                break;
            };
            match node.client().fetch_into(&owner, &file.md5, node.store()).await {
                Ok(received) => {
                    node.index(&received);
                    if received.placement == Placement::Stored {
                        info!(md5 = %file.md5, owner = %file.instance, size = received.size, "replicated file");
                    }
                }
                Err(e) => {
                    warn!(md5 = %file.md5, %owner, error = %e, "replication fetch failed");
                    break;
                }
            }
        }

        cursor = file.id;
        node.meta().set_cursor(&name, cursor)?;
        advanced += 1;
    }
    Ok(advanced)
}

/// Handle to a storage node's background jobs.
pub struct JobsHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl JobsHandle {
    /// Signal the jobs to stop and wait for them to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Abort the background tasks.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Check whether every job is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|task| !task.is_finished())
    }
}
