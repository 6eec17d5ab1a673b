//! Tracker service: registration, heartbeat release and the file catalog.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use reef_cluster::{ClusterError, Registry, SweeperHandle};
use reef_meta::MetaStore;
use reef_net::message::{
    GroupMember, RegisterFileRequest, RegisterStorageRequest, RegisterStorageResponse,
    SyncPullRequest, SyncPullResponse,
};
use reef_net::{Request, Status, read_frame_or_eof};
use reef_types::{Instance, InstanceId, InstanceRole, InstanceState};
use reef_worker::WorkerPool;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::error::NodeError;
use crate::server::{self, ConnectionHandler, ServerHandle};

/// Handles tracker connections.
pub struct TrackerService {
    secret: String,
    registry: Arc<Registry>,
    meta: Arc<MetaStore>,
}

impl TrackerService {
    /// Create a tracker service over an existing registry and catalog.
    pub fn new(secret: &str, registry: Arc<Registry>, meta: Arc<MetaStore>) -> Self {
        Self {
            secret: secret.to_string(),
            registry,
            meta,
        }
    }

    /// The registry this service mutates.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Request loop. Ids registered over this connection are collected in
    /// `registered` so the caller can release them however the loop ends.
    async fn session(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        registered: &mut HashSet<InstanceId>,
    ) -> Result<(), NodeError> {
        let mut validated = false;

        while let Some(frame) = read_frame_or_eof(stream).await? {
            let request = Request::from_frame(&frame)?;
            match request {
                Request::Validate(req) => {
                    if !server::validate(stream, peer, &self.secret, &req.secret).await? {
                        return Ok(());
                    }
                    validated = true;
                }
                Request::RegisterStorage(req) => {
                    if req.secret != self.secret {
                        warn!(%peer, id = %req.instance_id, "registration with bad secret");
                        server::respond(stream, &rejected(Status::BadSecret, peer)).await?;
                        return Ok(());
                    }
                    validated = true;
                    let (response, id) = self.register_storage(req, peer).await;
                    if let Some(id) = id {
                        registered.insert(id);
                    }
                    server::respond(stream, &response).await?;
                }
                other if !validated => {
                    server::reject_unvalidated(stream, peer, other.opcode()).await?;
                    return Ok(());
                }
                Request::RegisterFile(req) => {
                    let status = self.register_file(req);
                    server::respond_status(stream, status).await?;
                }
                Request::SyncPull(req) => {
                    let response = self.sync_pull(req);
                    server::respond(stream, &response).await?;
                }
                Request::Upload(_) | Request::Download(_) | Request::Query(_) => {
                    debug!(%peer, opcode = ?frame.opcode(), "operation not supported by tracker");
                    server::respond_status(stream, Status::OperationNotSupported).await?;
                    // An unread upload body would be parsed as the next frame.
                    if frame.body_len() > 0 {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    async fn register_storage(
        &self,
        req: RegisterStorageRequest,
        peer: SocketAddr,
    ) -> (RegisterStorageResponse, Option<InstanceId>) {
        let observed = peer.ip().to_string();
        let bind_host = if is_unspecified(&req.bind_addr) {
            observed.clone()
        } else {
            req.bind_addr
        };
        let advertise_host = if is_unspecified(&req.advertise_addr) {
            observed.clone()
        } else {
            req.advertise_addr
        };

        let instance = Instance {
            id: req.instance_id,
            role: InstanceRole::Storage,
            group: req.group,
            bind_host,
            bind_port: req.port,
            advertise_host,
            advertise_port: req.port,
            secret: req.secret,
            state: InstanceState::Hold,
            updated_at: 0,
        };

        match self.registry.put(instance).await {
            Ok(stored) => {
                let group_members = self
                    .registry
                    .group_members(InstanceRole::Storage, &stored.group)
                    .await
                    .into_iter()
                    .filter(|member| member.id != stored.id)
                    .map(|member| GroupMember {
                        addr: member.bind_host,
                        instance_id: member.id,
                        port: member.bind_port,
                        advertise_addr: member.advertise_host,
                        advertise_port: member.advertise_port,
                    })
                    .collect();
                let response = RegisterStorageResponse {
                    status: Status::Ok,
                    look_back_addr: observed,
                    group_members,
                };
                (response, Some(stored.id))
            }
            Err(ClusterError::RegistryConflict { id, existing }) => {
                warn!(%peer, %id, %existing, "rejecting conflicting registration");
                (rejected(Status::InstanceConflict, peer), None)
            }
        }
    }

    fn register_file(&self, req: RegisterFileRequest) -> Status {
        match self.meta.append_file(&req.file) {
            Ok(id) => {
                debug!(id, md5 = %req.file.md5, instance = %req.file.instance, "file registered");
                Status::Ok
            }
            Err(e) => {
                error!(md5 = %req.file.md5, error = %e, "failed to append to catalog");
                Status::InternalError
            }
        }
    }

    fn sync_pull(&self, req: SyncPullRequest) -> SyncPullResponse {
        match self.meta.next_file_after(req.last_id) {
            Ok(Some(file)) => SyncPullResponse {
                status: Status::Ok,
                file: Some(file),
            },
            Ok(None) => SyncPullResponse {
                status: Status::NotFound,
                file: None,
            },
            Err(e) => {
                error!(last_id = req.last_id, error = %e, "failed to read catalog");
                SyncPullResponse {
                    status: Status::InternalError,
                    file: None,
                }
            }
        }
    }
}

#[async_trait]
impl ConnectionHandler for TrackerService {
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), NodeError> {
        let mut registered = HashSet::new();
        let result = self.session(&mut stream, peer, &mut registered).await;
        drop(stream);

        for id in &registered {
            self.registry.free(id).await;
        }
        if !registered.is_empty() {
            debug!(%peer, count = registered.len(), "released registrations on close");
        }
        result
    }
}

fn rejected(status: Status, peer: SocketAddr) -> RegisterStorageResponse {
    RegisterStorageResponse {
        status,
        look_back_addr: peer.ip().to_string(),
        group_members: Vec::new(),
    }
}

/// Empty or wildcard addresses mean "use what the tracker observes".
fn is_unspecified(addr: &str) -> bool {
    matches!(addr.trim(), "" | "0.0.0.0" | "::" | "[::]")
}

/// A running tracker: registry, expiration sweep and accept loop.
pub struct TrackerNode {
    registry: Arc<Registry>,
    meta: Arc<MetaStore>,
    sweeper: SweeperHandle,
    server: ServerHandle,
}

impl TrackerNode {
    /// Start serving on `listener`.
    pub fn start(
        config: TrackerConfig,
        listener: TcpListener,
        meta: Arc<MetaStore>,
    ) -> Result<Self, NodeError> {
        let registry = Arc::new(Registry::new(config.registry.clone(), Some(meta.clone())));
        let sweeper = registry.spawn_sweeper();
        let service = Arc::new(TrackerService::new(
            &config.secret,
            registry.clone(),
            meta.clone(),
        ));
        let server = server::spawn_server(listener, service, WorkerPool::new(config.worker))?;
        info!(addr = %server.local_addr(), "tracker started");
        Ok(Self {
            registry,
            meta,
            sweeper,
            server,
        })
    }

    /// Address the tracker listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// The membership registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The file catalog.
    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    /// Stop accepting and stop the sweep.
    pub async fn shutdown(self) {
        self.server.stop().await;
        self.sweeper.stop().await;
        info!("tracker stopped");
    }
}
