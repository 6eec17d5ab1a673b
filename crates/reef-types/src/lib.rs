//! Shared types and identifiers for Reef.
//!
//! This crate defines the types used across the Reef workspace:
//! content identity ([`Digest`], [`ContentHasher`]), cluster membership
//! ([`Instance`], [`InstanceId`], [`InstanceRole`], [`InstanceState`]),
//! peer addressing ([`ServerEndpoint`]) and the tracker file catalog
//! ([`FileRecord`], [`PartMeta`]).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use md5::Digest as _;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Content digest
// ---------------------------------------------------------------------------

/// Content digest of a stored object: `md5(bytes)`.
///
/// Displayed as 32 lowercase hex characters. The digest is both the
/// integrity check for transfers and the storage key for placement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Digest([u8; 16]);

impl Digest {
    /// Hash arbitrary data in one shot.
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Parse a 32-character hex string (either case).
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Return the raw 16-byte representation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 16]> for Digest {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Running digest accumulator for streamed content.
#[derive(Default, Clone)]
pub struct ContentHasher(md5::Md5);

impl ContentHasher {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold more bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Consume the accumulator and return the final digest.
    pub fn finalize(self) -> Digest {
        let out = self.0.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&out);
        Digest(bytes)
    }
}

impl fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentHasher").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Cluster membership
// ---------------------------------------------------------------------------

/// Identifier of a cluster member, stable per data directory.
#[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

/// Role a cluster member plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceRole {
    /// Coordinates membership and the file catalog.
    Tracker,
    /// Stores object bytes.
    Storage,
    /// Forwards client traffic.
    Proxy,
}

/// Registry lifecycle state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    /// Actively leased: the member holds a live registration connection.
    Hold,
    /// Released: eligible for removal once the expiration window passes.
    Free,
}

/// A registered cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Member identity.
    pub id: InstanceId,
    /// Member role.
    pub role: InstanceRole,
    /// Replication group the member belongs to.
    pub group: String,
    /// Address the member binds to.
    pub bind_host: String,
    /// Port the member binds to.
    pub bind_port: u16,
    /// Address other members should use (differs from `bind_host` under NAT).
    pub advertise_host: String,
    /// Port other members should use.
    pub advertise_port: u16,
    /// Shared secret the member presented.
    pub secret: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Last update, nanoseconds since the Unix epoch.
    pub updated_at: u64,
}

impl Instance {
    /// Canonical `host:port` of the bind address, used as the conflict key.
    pub fn endpoint(&self) -> String {
        canonical_endpoint(&self.bind_host, self.bind_port)
    }

    /// Canonical `host:port` of the advertised address.
    pub fn advertised_endpoint(&self) -> String {
        canonical_endpoint(&self.advertise_host, self.advertise_port)
    }

    /// Whether two entries describe the same id on different endpoints.
    pub fn conflicts_with(&self, other: &Instance) -> bool {
        self.id == other.id && self.endpoint() != other.endpoint()
    }

    /// Build a connectable endpoint for this member, with the advertised
    /// address as failover when it differs from the bind address.
    pub fn server_endpoint(&self) -> ServerEndpoint {
        let mut endpoint = ServerEndpoint::new(&self.bind_host, self.bind_port, &self.secret);
        if self.advertised_endpoint() != self.endpoint() {
            endpoint = endpoint.with_alternate(&self.advertise_host, self.advertise_port);
        }
        if self.role == InstanceRole::Tracker {
            endpoint = endpoint.tracker();
        }
        endpoint
    }
}

/// Normalize a host and port into the canonical `host:port` string.
///
/// Hosts are trimmed and lowercased; IPv6 literals are bracketed.
pub fn canonical_endpoint(host: &str, port: u16) -> String {
    let host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// A connectable peer: `(host, port, secret)` plus failover information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Primary host.
    pub host: String,
    /// Primary port.
    pub port: u16,
    /// Secret presented during connection validation.
    pub secret: String,
    /// Alternate (advertised) address tried once when the primary dial fails.
    pub alternate: Option<(String, u16)>,
    /// Trackers never fail over.
    pub is_tracker: bool,
}

impl ServerEndpoint {
    /// Create an endpoint without an alternate address.
    pub fn new(host: &str, port: u16, secret: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            secret: secret.to_string(),
            alternate: None,
            is_tracker: false,
        }
    }

    /// Parse a `host:port` string.
    pub fn parse(addr: &str, secret: &str) -> Option<Self> {
        let (host, port) = addr.trim().rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port, secret))
    }

    /// Set the alternate address.
    pub fn with_alternate(mut self, host: &str, port: u16) -> Self {
        self.alternate = Some((host.to_string(), port));
        self
    }

    /// Mark the endpoint as a tracker.
    pub fn tracker(mut self) -> Self {
        self.is_tracker = true;
        self
    }

    /// Canonical `host:port` key.
    pub fn canonical(&self) -> String {
        canonical_endpoint(&self.host, self.port)
    }

    /// Canonical key of the alternate address, if any.
    pub fn alternate_canonical(&self) -> Option<String> {
        self.alternate
            .as_ref()
            .map(|(host, port)| canonical_endpoint(host, *port))
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

// ---------------------------------------------------------------------------
// File catalog
// ---------------------------------------------------------------------------

/// One part of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMeta {
    /// Digest of the part.
    pub md5: Digest,
    /// Size of the part in bytes.
    pub size: u64,
}

/// A file known to the tracker catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Catalog sequence number, assigned by the tracker (0 when unassigned).
    pub id: u64,
    /// Digest of the whole file.
    pub md5: Digest,
    /// Number of parts.
    pub part_num: u32,
    /// Instance that first stored the file.
    pub instance: InstanceId,
    /// Per-part digests and sizes.
    pub parts: Vec<PartMeta>,
}

impl FileRecord {
    /// A single-part record for a whole-object upload.
    pub fn single(md5: Digest, size: u64, instance: InstanceId) -> Self {
        Self {
            id: 0,
            md5,
            part_num: 1,
            instance,
            parts: vec![PartMeta { md5, size }],
        }
    }

    /// Total size across all parts.
    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }
}

/// Current time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
