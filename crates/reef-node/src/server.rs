//! Accept loop shared by tracker and storage nodes.
//!
//! Every accepted connection becomes one worker-pool task. When the pool
//! is saturated the connection is dropped on the spot, which is the node's
//! only form of load shedding.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use reef_net::message::StatusResponse;
use reef_net::{NetError, Opcode, Status, write_frame};
use reef_worker::{TaskError, WorkerPool};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::NodeError;

/// Serves one accepted connection until the peer closes it or a protocol
/// error ends it.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Run the request loop of a single connection.
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr)
    -> Result<(), NodeError>;
}

/// Accept connections until `shutdown` fires.
pub async fn serve<H: ConnectionHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    workers: WorkerPool,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let handler = handler.clone();
                    let task = async move {
                        handler
                            .handle_connection(stream, peer)
                            .await
                            .map_err(|e| Box::new(e) as TaskError)
                    };
                    // A refused task is dropped along with its stream.
                    if let Err(e) = workers.submit(task) {
                        warn!(%peer, error = %e, "dropping connection");
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Start [`serve`] on a background task.
pub fn spawn_server<H: ConnectionHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    workers: WorkerPool,
) -> Result<ServerHandle, NodeError> {
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        info!(addr = %local_addr, "listening");
        serve(listener, handler, workers, shutdown_rx).await;
        debug!(addr = %local_addr, "accept loop stopped");
    });
    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        task,
    })
}

/// Handle to a running accept loop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the loop to exit. Connections already
    /// handed to the worker pool run to completion.
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

/// Write a bodiless response frame.
pub(crate) async fn respond<T: Serialize>(stream: &mut TcpStream, meta: &T) -> Result<(), NetError> {
    write_frame(stream, Opcode::Response, meta, 0).await
}

/// Write a status-only response.
pub(crate) async fn respond_status(stream: &mut TcpStream, status: Status) -> Result<(), NetError> {
    respond(stream, &StatusResponse::new(status)).await
}

/// Answer a `CONNECT_VALIDATE` request. Returns whether the secret matched;
/// on a mismatch `BAD_SECRET` has been sent and the caller closes.
pub(crate) async fn validate(
    stream: &mut TcpStream,
    peer: SocketAddr,
    expected: &str,
    presented: &str,
) -> Result<bool, NetError> {
    if presented != expected {
        warn!(%peer, "rejecting connection with bad secret");
        respond_status(stream, Status::BadSecret).await?;
        return Ok(false);
    }
    respond_status(stream, Status::Ok).await?;
    Ok(true)
}

/// Reject a request that arrived before validation. The caller closes.
pub(crate) async fn reject_unvalidated(
    stream: &mut TcpStream,
    peer: SocketAddr,
    opcode: Opcode,
) -> Result<(), NetError> {
    warn!(%peer, ?opcode, "request before validation");
    respond_status(stream, Status::BadSecret).await
}
