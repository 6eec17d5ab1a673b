//! Outbound connection pool.
//!
//! Connections are cached per destination (the canonical `host:port` of the
//! primary address). Each destination admits at most
//! [`PoolConfig::max_per_endpoint`] open connections, idle ones included.
//! A caller that finds the cap reached with nothing idle gets
//! [`NetError::PoolExhausted`] immediately; the pool never waits.
//!
//! Every new connection is validated with `CONNECT_VALIDATE` before it is
//! handed out, so a pooled connection always belongs to a peer that accepted
//! our secret.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reef_types::ServerEndpoint;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::codec::{Opcode, read_frame, write_frame};
use crate::error::NetError;
use crate::message::{Status, StatusResponse, ValidateRequest};

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum open connections per destination (in use plus idle).
    pub max_per_endpoint: usize,
    /// Bound on TCP connect plus the validation exchange.
    pub dial_timeout: Duration,
    /// Idle connections older than this are closed instead of reused.
    pub idle_ttl: Duration,
}

impl PoolConfig {
    /// Defaults for a running node.
    pub fn default_config() -> Self {
        Self {
            max_per_endpoint: 256,
            dial_timeout: Duration::from_secs(5),
            idle_ttl: Duration::from_secs(60),
        }
    }

    /// Small limits and short timeouts for tests.
    pub fn test_config() -> Self {
        Self {
            max_per_endpoint: 4,
            dial_timeout: Duration::from_millis(500),
            idle_ttl: Duration::from_secs(30),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Point-in-time view of one destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections counted against the cap (in use plus idle).
    pub active: usize,
    /// Connections parked in the idle queue.
    pub idle: usize,
}

struct IdleConn {
    stream: TcpStream,
    peer: String,
    since: Instant,
}

/// Open-connection counters per destination.
type Counters = Mutex<HashMap<String, usize>>;

/// Idle queues per destination.
type IdleQueues = Mutex<HashMap<String, VecDeque<IdleConn>>>;

/// Release one admission slot for `key`.
fn release_slot(counters: &Counters, key: &str) {
    let mut map = counters.lock().expect("pool counter lock poisoned");
    if let Some(active) = map.get_mut(key) {
        *active = active.saturating_sub(1);
    }
}

/// Holds one admission slot; frees it on drop unless disarmed.
struct Slot {
    key: String,
    counters: Arc<Counters>,
    armed: bool,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            release_slot(&self.counters, &self.key);
        }
    }
}

/// A connection checked out of the pool.
///
/// Hand it back with [`ConnectionPool::return_healthy`] after a complete
/// exchange, or [`ConnectionPool::return_broken`] after any failure that may
/// have left the stream mid-frame. Dropping it is equivalent to
/// `return_broken`.
pub struct PooledConn {
    stream: TcpStream,
    peer: String,
    slot: Slot,
}

impl PooledConn {
    /// The underlying socket.
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Destination key the connection is counted against.
    pub fn key(&self) -> &str {
        &self.slot.key
    }

    /// Address actually dialed (differs from `key` after failover).
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("key", &self.slot.key)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Per-destination cache of validated TCP connections.
///
/// The idle queues and the admission counters sit behind separate locks;
/// neither is held across a dial.
pub struct ConnectionPool {
    config: PoolConfig,
    idle: IdleQueues,
    counters: Arc<Counters>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection to `server`.
    ///
    /// Idle connections are reused first (oldest first); stale or dead ones
    /// are closed and skipped. Otherwise a slot is reserved and a new
    /// connection dialed. If the primary address cannot be reached and the
    /// destination is not a tracker, the advertised alternate is tried once.
    pub async fn get_conn(&self, server: &ServerEndpoint) -> Result<PooledConn, NetError> {
        let key = server.canonical();

        loop {
            let reused = {
                let mut queues = self.idle.lock().expect("pool idle lock poisoned");
                queues.get_mut(&key).and_then(VecDeque::pop_front)
            };

            let Some(idle) = reused else {
                self.reserve(&key)?;
                break;
            };

            if idle.since.elapsed() > self.config.idle_ttl {
                debug!(endpoint = %key, "closing idle connection past ttl");
                release_slot(&self.counters, &key);
                continue;
            }
            if !is_alive(&idle.stream) {
                debug!(endpoint = %key, "closing dead idle connection");
                release_slot(&self.counters, &key);
                continue;
            }

            trace!(endpoint = %key, "reusing idle connection");
            return Ok(PooledConn {
                stream: idle.stream,
                peer: idle.peer,
                slot: self.slot(key),
            });
        }

        // A slot is reserved for `key` from here on; dropping the guard on a
        // failed dial frees it.
        let slot = self.slot(key);
        let (stream, peer) = self.dial(server).await?;
        Ok(PooledConn { stream, peer, slot })
    }

    /// Count a new connection against `key`, or fail if the cap is reached.
    fn reserve(&self, key: &str) -> Result<(), NetError> {
        let mut counters = self.counters.lock().expect("pool counter lock poisoned");
        let active = counters.entry(key.to_string()).or_default();
        if *active >= self.config.max_per_endpoint {
            return Err(NetError::PoolExhausted {
                endpoint: key.to_string(),
                max: self.config.max_per_endpoint,
            });
        }
        *active += 1;
        Ok(())
    }

    fn slot(&self, key: String) -> Slot {
        Slot {
            key,
            counters: self.counters.clone(),
            armed: true,
        }
    }

    /// Park a connection after a complete, well-formed exchange.
    pub fn return_healthy(&self, conn: PooledConn) {
        let PooledConn {
            stream,
            peer,
            mut slot,
        } = conn;
        slot.armed = false;
        let mut queues = self.idle.lock().expect("pool idle lock poisoned");
        queues.entry(slot.key.clone()).or_default().push_back(IdleConn {
            stream,
            peer,
            since: Instant::now(),
        });
    }

    /// Close a connection and free its slot.
    pub fn return_broken(&self, conn: PooledConn) {
        trace!(endpoint = %conn.key(), "closing broken connection");
        drop(conn);
    }

    /// Counters for one destination.
    pub fn stats(&self, server: &ServerEndpoint) -> PoolStats {
        let key = server.canonical();
        let idle = {
            let queues = self.idle.lock().expect("pool idle lock poisoned");
            queues.get(&key).map_or(0, VecDeque::len)
        };
        let active = {
            let counters = self.counters.lock().expect("pool counter lock poisoned");
            counters.get(&key).copied().unwrap_or_default()
        };
        PoolStats { active, idle }
    }

    /// Drop every idle connection (in-use ones are unaffected).
    pub fn close_idle(&self) {
        let drained: Vec<(String, usize)> = {
            let mut queues = self.idle.lock().expect("pool idle lock poisoned");
            queues
                .iter_mut()
                .map(|(key, queue)| {
                    let closed = queue.len();
                    queue.clear();
                    (key.clone(), closed)
                })
                .collect()
        };
        let mut counters = self.counters.lock().expect("pool counter lock poisoned");
        for (key, closed) in drained {
            if let Some(active) = counters.get_mut(&key) {
                *active = active.saturating_sub(closed);
            }
        }
    }

    async fn dial(&self, server: &ServerEndpoint) -> Result<(TcpStream, String), NetError> {
        let primary = server.canonical();
        match self.dial_one(&server.host, server.port, &server.secret).await {
            Ok(stream) => Ok((stream, primary)),
            Err(e) if e.is_dial_failure() && !server.is_tracker => {
                let Some((host, port)) = &server.alternate else {
                    return Err(e);
                };
                let alternate = server.alternate_canonical().unwrap_or_default();
                if alternate == primary {
                    return Err(e);
                }
                warn!(%primary, %alternate, error = %e, "primary unreachable, trying advertised address");
                let stream = self.dial_one(host, *port, &server.secret).await?;
                Ok((stream, alternate))
            }
            Err(e) => Err(e),
        }
    }

    async fn dial_one(&self, host: &str, port: u16, secret: &str) -> Result<TcpStream, NetError> {
        let endpoint = reef_types::canonical_endpoint(host, port);
        let bare = host.trim().trim_start_matches('[').trim_end_matches(']');

        let attempt = async {
            let mut stream = TcpStream::connect((bare, port))
                .await
                .map_err(|e| NetError::Connect {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })?;
            stream.set_nodelay(true)?;
            validate(&mut stream, secret, &endpoint).await?;
            Ok::<_, NetError>(stream)
        };

        match tokio::time::timeout(self.config.dial_timeout, attempt).await {
            Ok(Ok(stream)) => {
                debug!(%endpoint, "connection established");
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NetError::Timeout(endpoint)),
        }
    }
}

/// Present our secret on a fresh connection.
async fn validate(stream: &mut TcpStream, secret: &str, endpoint: &str) -> Result<(), NetError> {
    write_frame(
        stream,
        Opcode::ConnectValidate,
        &ValidateRequest {
            secret: secret.to_string(),
        },
        0,
    )
    .await?;

    let frame = read_frame(stream).await?;
    if frame.opcode() != Opcode::Response || frame.body_len() != 0 {
        return Err(NetError::UnexpectedResponse(format!(
            "{:?} frame answering validation",
            frame.opcode()
        )));
    }
    let response: StatusResponse = frame.decode_meta()?;
    match response.status {
        Status::Ok => Ok(()),
        Status::BadSecret => Err(NetError::BadSecret(endpoint.to_string())),
        other => Err(NetError::Status(other)),
    }
}

/// Non-blocking liveness probe for an idle connection.
///
/// An idle connection has no request outstanding, so a healthy one has
/// nothing to read. End-of-stream means the peer closed; unsolicited bytes
/// mean the stream is out of sync.
fn is_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Ok(_) | Err(_) => false,
    }
}
