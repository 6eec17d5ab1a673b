//! Storage service: uploads, downloads and queries against the local
//! object store.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rand::RngCore;
use reef_meta::{IndexEntry, MetaStore};
use reef_net::message::{
    DownloadRequest, GroupMember, QueryRequest, QueryResponse, StatusResponse, UploadRequest,
    UploadResponse,
};
use reef_net::{ConnectionPool, Opcode, Request, Status, read_frame_or_eof, send_body, write_frame};
use reef_store::{ObjectStore, Placement, Received, StoreError, relative_path, resolve};
use reef_types::{Digest, FileRecord, InstanceId, PartMeta, ServerEndpoint};
use reef_worker::WorkerPool;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::StorageConfig;
use crate::error::NodeError;
use crate::jobs::{self, JobsHandle};
use crate::server::{self, ConnectionHandler, ServerHandle};

/// File holding the stable instance id inside the data directory.
pub const INSTANCE_ID_FILE: &str = "instance.id";

/// A storage node's state, shared by the connection handler and the
/// background jobs.
pub struct StorageNode {
    config: StorageConfig,
    id: InstanceId,
    /// Host sent to trackers as the bind address; empty when listening on a
    /// wildcard address.
    bind_host: String,
    port: u16,
    store: ObjectStore,
    meta: Arc<MetaStore>,
    client: Client,
    trackers: Vec<ServerEndpoint>,
    members: RwLock<Vec<GroupMember>>,
}

impl StorageNode {
    /// Open the data directory and prepare a node that will listen on
    /// `listen_addr`.
    pub fn open(config: StorageConfig, listen_addr: SocketAddr) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let id = load_or_create_instance_id(&config.data_dir)?;
        let store = ObjectStore::new(config.objects_dir())?;
        let meta = Arc::new(MetaStore::open(config.meta_dir())?);

        let trackers = config
            .trackers
            .iter()
            .map(|addr| {
                ServerEndpoint::parse(addr, &config.secret)
                    .map(ServerEndpoint::tracker)
                    .ok_or_else(|| NodeError::InvalidAddress(addr.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let bind_host = if listen_addr.ip().is_unspecified() {
            String::new()
        } else {
            listen_addr.ip().to_string()
        };
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        let client = Client::new(pool, config.buffer_size);

        info!(%id, group = %config.group, data_dir = %config.data_dir.display(), "storage node opened");
        Ok(Self {
            id,
            bind_host,
            port: listen_addr.port(),
            store,
            meta,
            client,
            trackers,
            members: RwLock::new(Vec::new()),
            config,
        })
    }

    /// Stable identity of this node.
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Node configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The local object store.
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// The local metadata store.
    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    /// Outbound client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Configured trackers.
    pub fn trackers(&self) -> &[ServerEndpoint] {
        &self.trackers
    }

    /// Host and port sent to trackers on registration.
    pub(crate) fn bind_addr(&self) -> (&str, u16) {
        (&self.bind_host, self.port)
    }

    /// Group members learned from the last heartbeat.
    pub fn members(&self) -> Vec<GroupMember> {
        self.members.read().expect("members lock poisoned").clone()
    }

    pub(crate) fn set_members(&self, members: Vec<GroupMember>) {
        *self.members.write().expect("members lock poisoned") = members;
    }

    /// Connectable endpoint of a group member, failing over to its
    /// advertised address.
    pub(crate) fn member_endpoint(&self, id: &InstanceId) -> Option<ServerEndpoint> {
        let members = self.members.read().expect("members lock poisoned");
        let member = members.iter().find(|m| &m.instance_id == id)?;
        let mut endpoint = ServerEndpoint::new(&member.addr, member.port, &self.config.secret);
        if (member.advertise_addr.as_str(), member.advertise_port)
            != (member.addr.as_str(), member.port)
        {
            endpoint = endpoint.with_alternate(&member.advertise_addr, member.advertise_port);
        }
        Some(endpoint)
    }

    /// Record a stored object in the existence index.
    pub(crate) fn index(&self, received: &Received) {
        let entry = IndexEntry {
            size: received.size,
            parts: vec![PartMeta {
                md5: received.digest,
                size: received.size,
            }],
        };
        if let Err(e) = self.meta.record(&received.digest, &entry) {
            error!(digest = %received.digest, error = %e, "failed to index object");
        }
    }

    /// Request loop of one client connection.
    async fn session(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<(), NodeError> {
        let mut validated = false;

        while let Some(frame) = read_frame_or_eof(stream).await? {
            let request = Request::from_frame(&frame)?;
            match request {
                Request::Validate(req) => {
                    if !server::validate(stream, peer, &self.config.secret, &req.secret).await? {
                        return Ok(());
                    }
                    validated = true;
                }
                other if !validated => {
                    server::reject_unvalidated(stream, peer, other.opcode()).await?;
                    return Ok(());
                }
                Request::Upload(req) => self.upload(stream, peer, req).await?,
                Request::Download(req) => self.download(stream, req).await?,
                Request::Query(req) => self.query(stream, req).await?,
                Request::RegisterStorage(_) | Request::RegisterFile(_) | Request::SyncPull(_) => {
                    debug!(%peer, opcode = ?frame.opcode(), "operation not supported by storage");
                    server::respond_status(stream, Status::OperationNotSupported).await?;
                }
            }
        }
        Ok(())
    }

    async fn upload(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        req: UploadRequest,
    ) -> Result<(), NodeError> {
        let received = match self
            .store
            .receive(stream, req.file_size, self.config.buffer_size, req.md5)
            .await
        {
            Ok(received) => received,
            Err(e @ StoreError::DigestMismatch { .. }) => {
                warn!(%peer, error = %e, "rejecting upload");
                server::respond(stream, &upload_failed()).await?;
                return Ok(());
            }
            Err(e) => {
                // The body position is unknown; answer if we can and close.
                let _ = server::respond(stream, &upload_failed()).await;
                return Err(e.into());
            }
        };

        self.index(&received);
        if received.placement == Placement::Stored {
            self.register_with_trackers(&received).await;
        }

        let path = with_extension(relative_path(&received.digest), &req.ext);
        info!(%peer, digest = %received.digest, size = received.size, placement = ?received.placement, "upload complete");
        server::respond(
            stream,
            &UploadResponse {
                status: Status::Ok,
                path,
            },
        )
        .await?;
        Ok(())
    }

    /// Add a freshly stored file to every tracker's catalog.
    async fn register_with_trackers(&self, received: &Received) {
        let file = FileRecord::single(received.digest, received.size, self.id.clone());
        for tracker in &self.trackers {
            if let Err(e) = self.client.register_file(tracker, file.clone()).await {
                warn!(%tracker, digest = %received.digest, error = %e, "failed to register file");
            }
        }
    }

    async fn download(&self, stream: &mut TcpStream, req: DownloadRequest) -> Result<(), NodeError> {
        let Ok(digest) = resolve(&req.path) else {
            debug!(path = %req.path, "download of invalid path");
            server::respond_status(stream, Status::NotFound).await?;
            return Ok(());
        };

        let Some((mut file, size)) = self.store.open(&digest).await? else {
            debug!(%digest, "download of missing object");
            server::respond_status(stream, Status::NotFound).await?;
            return Ok(());
        };

        write_frame(stream, Opcode::Response, &StatusResponse::new(Status::Ok), size).await?;
        send_body(&mut file, stream, size, self.config.buffer_size).await?;
        debug!(%digest, size, "download served");
        Ok(())
    }

    async fn query(&self, stream: &mut TcpStream, req: QueryRequest) -> Result<(), NodeError> {
        let Ok(digest) = resolve(&req.path_or_md5) else {
            server::respond_status(stream, Status::NotFound).await?;
            return Ok(());
        };
        let size = self.object_size(&digest).await?;
        let response = QueryResponse {
            status: Status::Ok,
            exists: size.is_some(),
            file_size: size.unwrap_or(0),
        };
        server::respond(stream, &response).await?;
        Ok(())
    }

    /// Size of a local object: the index first, then the object store.
    async fn object_size(&self, digest: &Digest) -> Result<Option<u64>, NodeError> {
        match self.meta.lookup(digest) {
            Ok(Some(entry)) => return Ok(Some(entry.size)),
            Ok(None) => {}
            Err(e) => warn!(%digest, error = %e, "index lookup failed"),
        }
        Ok(self.store.size(digest).await?)
    }
}

#[async_trait]
impl ConnectionHandler for StorageNode {
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), NodeError> {
        self.session(&mut stream, peer).await
    }
}

fn upload_failed() -> UploadResponse {
    UploadResponse {
        status: Status::InternalError,
        path: String::new(),
    }
}

/// Append `.ext` to a stored path. Extensions that could escape the path
/// are dropped.
fn with_extension(path: String, ext: &str) -> String {
    let ext = ext.trim_start_matches('.');
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return path;
    }
    format!("{path}.{ext}")
}

/// Load the instance id from the data directory, or generate and persist
/// a new one.
pub fn load_or_create_instance_id(data_dir: &Path) -> Result<InstanceId, NodeError> {
    let path = data_dir.join(INSTANCE_ID_FILE);
    if path.exists() {
        let id = std::fs::read_to_string(&path)?.trim().to_string();
        if !id.is_empty() {
            debug!(path = %path.display(), "loaded instance id");
            return Ok(InstanceId::new(id));
        }
        warn!(path = %path.display(), "empty instance id file, regenerating");
    }

    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    let id = hex::encode(bytes);
    std::fs::write(&path, &id)?;
    info!(path = %path.display(), %id, "generated new instance id");
    Ok(InstanceId::new(id))
}

/// A running storage node: accept loop plus heartbeat and sync jobs.
pub struct StorageHandle {
    node: Arc<StorageNode>,
    server: ServerHandle,
    jobs: JobsHandle,
}

impl StorageHandle {
    /// Start serving `node` on `listener` and start its background jobs.
    pub fn start(node: Arc<StorageNode>, listener: TcpListener) -> Result<Self, NodeError> {
        let workers = WorkerPool::new(node.config.worker.clone());
        let server = server::spawn_server(listener, node.clone(), workers)?;
        let jobs = jobs::spawn(&node);
        info!(id = %node.id, addr = %server.local_addr(), "storage node started");
        Ok(Self { node, server, jobs })
    }

    /// The node being served.
    pub fn node(&self) -> &Arc<StorageNode> {
        &self.node
    }

    /// Address the node listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Whether the accept loop and both jobs are still running.
    pub fn is_running(&self) -> bool {
        self.server.is_running() && self.jobs.is_running()
    }

    /// Stop the jobs and the accept loop, then drop idle outbound
    /// connections (which releases the tracker registrations).
    pub async fn shutdown(self) {
        self.jobs.stop().await;
        self.server.stop().await;
        self.node.client.pool().close_idle();
        info!(id = %self.node.id, "storage node stopped");
    }
}
