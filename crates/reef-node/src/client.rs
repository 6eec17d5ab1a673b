//! Outbound calls to trackers and storage nodes.
//!
//! Each call is one request/response exchange over a pooled connection.
//! A complete exchange (including one that ends in a non-OK status) gives
//! the connection back healthy; anything that leaves the stream position
//! unknown returns it broken.

use std::sync::Arc;

use reef_net::message::{
    DownloadRequest, QueryRequest, QueryResponse, RegisterFileRequest, RegisterStorageRequest,
    RegisterStorageResponse, StatusResponse, SyncPullRequest, SyncPullResponse, UploadRequest,
    UploadResponse,
};
use reef_net::{
    ConnectionPool, Frame, NetError, Opcode, PooledConn, Request, Status, read_frame,
    receive_body, send_body,
};
use reef_store::{ObjectStore, Received, StoreError};
use reef_types::{Digest, FileRecord, ServerEndpoint};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::NodeError;

/// Protocol client over a shared [`ConnectionPool`].
#[derive(Clone)]
pub struct Client {
    pool: Arc<ConnectionPool>,
    buffer_size: usize,
}

impl Client {
    /// Create a client. `buffer_size` is the chunk size for body transfers.
    pub fn new(pool: Arc<ConnectionPool>, buffer_size: usize) -> Self {
        Self { pool, buffer_size }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Check that `server` is reachable and accepts our secret.
    ///
    /// Validation happens when the pool dials; a reused idle connection was
    /// validated when it was opened.
    pub async fn validate(&self, server: &ServerEndpoint) -> Result<(), NetError> {
        let conn = self.pool.get_conn(server).await?;
        self.pool.return_healthy(conn);
        Ok(())
    }

    /// Register (or refresh) a storage node with a tracker.
    pub async fn register_storage(
        &self,
        server: &ServerEndpoint,
        req: RegisterStorageRequest,
    ) -> Result<RegisterStorageResponse, NetError> {
        self.exchange(server, &Request::RegisterStorage(req)).await
    }

    /// Add a file to a tracker's catalog.
    pub async fn register_file(
        &self,
        server: &ServerEndpoint,
        file: FileRecord,
    ) -> Result<(), NetError> {
        let _: StatusResponse = self
            .exchange(server, &Request::RegisterFile(RegisterFileRequest { file }))
            .await?;
        Ok(())
    }

    /// Upload `len` bytes from `source`. Returns the stored path.
    pub async fn upload<R>(
        &self,
        server: &ServerEndpoint,
        source: &mut R,
        len: u64,
        ext: &str,
        md5: Option<Digest>,
    ) -> Result<String, NetError>
    where
        R: AsyncRead + Unpin,
    {
        let request = Request::Upload(UploadRequest {
            file_size: len,
            ext: ext.to_string(),
            md5,
        });
        let mut conn = self.pool.get_conn(server).await?;
        let result = async {
            request.write_to(conn.stream(), len).await?;
            let sent = send_body(source, conn.stream(), len, self.buffer_size).await?;
            debug!(endpoint = %conn.peer(), digest = %sent, len, "upload body sent");
            let frame = read_response(conn.stream()).await?;
            let response: UploadResponse = frame.decode_response()?;
            Ok::<_, NetError>(response.path)
        }
        .await;
        self.release(conn, result.as_ref().err());
        result
    }

    /// Download the object at `path` into `sink`. Returns its size and the
    /// digest of the received bytes.
    pub async fn download<W>(
        &self,
        server: &ServerEndpoint,
        path: &str,
        sink: &mut W,
    ) -> Result<(u64, Digest), NetError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut conn = self.pool.get_conn(server).await?;
        let result = async {
            let len = request_download(conn.stream(), path).await?;
            let digest = receive_body(conn.stream(), sink, len, self.buffer_size).await?;
            Ok::<_, NetError>((len, digest))
        }
        .await;
        self.release(conn, result.as_ref().err());
        result
    }

    /// Download the object named by `digest` straight into `store`,
    /// verifying the content against the digest.
    pub async fn fetch_into(
        &self,
        server: &ServerEndpoint,
        digest: &Digest,
        store: &ObjectStore,
    ) -> Result<Received, NodeError> {
        let mut conn = self.pool.get_conn(server).await?;
        let len = match request_download(conn.stream(), &digest.to_hex()).await {
            Ok(len) => len,
            Err(e) => {
                self.release(conn, Some(&e));
                return Err(e.into());
            }
        };

        match store
            .receive(conn.stream(), len, self.buffer_size, Some(*digest))
            .await
        {
            Ok(received) => {
                self.pool.return_healthy(conn);
                Ok(received)
            }
            // The body was read in full, the exchange is complete.
            Err(e @ StoreError::DigestMismatch { .. }) => {
                self.pool.return_healthy(conn);
                Err(e.into())
            }
            Err(e) => {
                self.pool.return_broken(conn);
                Err(e.into())
            }
        }
    }

    /// Ask whether an object exists and how large it is.
    pub async fn query(
        &self,
        server: &ServerEndpoint,
        path_or_md5: &str,
    ) -> Result<QueryResponse, NetError> {
        let request = Request::Query(QueryRequest {
            path_or_md5: path_or_md5.to_string(),
        });
        self.exchange(server, &request).await
    }

    /// Next catalog entry after `last_id`, or `None` when caught up.
    pub async fn sync_pull(
        &self,
        server: &ServerEndpoint,
        last_id: u64,
    ) -> Result<Option<FileRecord>, NetError> {
        let request = Request::SyncPull(SyncPullRequest { last_id });
        match self.exchange::<SyncPullResponse>(server, &request).await {
            Ok(response) => Ok(response.file),
            Err(NetError::Status(Status::NotFound)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Send a bodiless request and decode the response record.
    async fn exchange<T: DeserializeOwned>(
        &self,
        server: &ServerEndpoint,
        request: &Request,
    ) -> Result<T, NetError> {
        let mut conn = self.pool.get_conn(server).await?;
        let result = async {
            request.write_to(conn.stream(), 0).await?;
            let frame = read_response(conn.stream()).await?;
            frame.decode_response()
        }
        .await;
        self.release(conn, result.as_ref().err());
        result
    }

    fn release(&self, conn: PooledConn, error: Option<&NetError>) {
        match error {
            Some(e) if !e.connection_reusable() => self.pool.return_broken(conn),
            _ => self.pool.return_healthy(conn),
        }
    }
}

/// Send a `DOWNLOAD` and read the response header. Returns the body length
/// that follows.
async fn request_download(stream: &mut TcpStream, path: &str) -> Result<u64, NetError> {
    let request = Request::Download(DownloadRequest {
        path: path.to_string(),
    });
    request.write_to(stream, 0).await?;
    let frame = read_response(stream).await?;
    let _: StatusResponse = frame.decode_response()?;
    Ok(frame.body_len())
}

async fn read_response(stream: &mut TcpStream) -> Result<Frame, NetError> {
    let frame = read_frame(stream).await?;
    if frame.opcode() != Opcode::Response {
        return Err(NetError::UnexpectedResponse(format!(
            "expected a response, got {:?}",
            frame.opcode()
        )));
    }
    Ok(frame)
}
