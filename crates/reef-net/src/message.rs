//! Meta records carried by each opcode.
//!
//! All records are postcard-encoded. Requests are grouped in [`Request`];
//! responses are always sent with [`Opcode::Response`] and decoded by the
//! caller into the record matching the request it sent.

use reef_types::{Digest, FileRecord, InstanceId};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::codec::{Frame, Opcode, encode_meta, write_raw_frame};
use crate::error::NetError;

/// Response status codes.
///
/// Variant order is the wire value (postcard encodes the variant index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Success.
    Ok,
    /// The secret was missing or wrong.
    BadSecret,
    /// The receiving role does not implement the opcode.
    OperationNotSupported,
    /// The receiver failed while serving the request.
    InternalError,
    /// The requested object or catalog entry does not exist.
    NotFound,
    /// Registration rejected: the instance id is live on another endpoint.
    InstanceConflict,
}

impl Status {
    /// Turn a non-OK status into an error.
    pub fn ok(self) -> Result<(), NetError> {
        match self {
            Status::Ok => Ok(()),
            other => Err(NetError::Status(other)),
        }
    }
}

/// `CONNECT_VALIDATE` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    /// Shared cluster secret.
    pub secret: String,
}

/// Status-only response (validation, file registration, download header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Outcome.
    pub status: Status,
}

impl StatusResponse {
    /// Shorthand constructor.
    pub fn new(status: Status) -> Self {
        Self { status }
    }
}

/// `REGISTER_STORAGE` request, also used as the storage heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterStorageRequest {
    /// Shared cluster secret.
    pub secret: String,
    /// Address the storage node listens on.
    pub bind_addr: String,
    /// Address other members should use; empty means "whatever the tracker
    /// observes".
    pub advertise_addr: String,
    /// Replication group.
    pub group: String,
    /// Stable identity of the storage node.
    pub instance_id: InstanceId,
    /// Listen port.
    pub port: u16,
}

/// A storage node in the same group as the registering node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Bind address.
    pub addr: String,
    /// Identity.
    pub instance_id: InstanceId,
    /// Bind port.
    pub port: u16,
    /// Advertised address (failover target).
    pub advertise_addr: String,
    /// Advertised port.
    pub advertise_port: u16,
}

/// `REGISTER_STORAGE` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterStorageResponse {
    /// Outcome.
    pub status: Status,
    /// The registering node's address as observed by the tracker.
    pub look_back_addr: String,
    /// Other storage nodes of the same group.
    pub group_members: Vec<GroupMember>,
}

/// `REGISTER_FILE` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFileRequest {
    /// The file to add to the catalog (`id` is assigned by the tracker).
    pub file: FileRecord,
}

/// `UPLOAD` request; the body carries `file_size` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Declared content length (must equal the frame body length).
    pub file_size: u64,
    /// Optional file extension, appended to the returned path.
    pub ext: String,
    /// Expected digest; verified after the transfer when present.
    pub md5: Option<Digest>,
}

/// `UPLOAD` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Outcome.
    pub status: Status,
    /// Relative path of the stored object.
    pub path: String,
}

/// `QUERY` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// A returned upload path or a bare hex digest.
    pub path_or_md5: String,
}

/// `QUERY` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Outcome.
    pub status: Status,
    /// Whether the object is stored.
    pub exists: bool,
    /// Stored size in bytes (0 when absent).
    pub file_size: u64,
}

/// `DOWNLOAD` request. Answered with a [`StatusResponse`] and the content
/// as the response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// A returned upload path or a bare hex digest.
    pub path: String,
}

/// `SYNC_PULL` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPullRequest {
    /// Last catalog id the caller has processed.
    pub last_id: u64,
}

/// `SYNC_PULL` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPullResponse {
    /// `Ok` with a file, or `NotFound` when the caller is caught up.
    pub status: Status,
    /// The next catalog entry, parts included.
    pub file: Option<FileRecord>,
}

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `CONNECT_VALIDATE`.
    Validate(ValidateRequest),
    /// `REGISTER_STORAGE`.
    RegisterStorage(RegisterStorageRequest),
    /// `REGISTER_FILE`.
    RegisterFile(RegisterFileRequest),
    /// `UPLOAD` (body still unread on the connection).
    Upload(UploadRequest),
    /// `DOWNLOAD`.
    Download(DownloadRequest),
    /// `QUERY`.
    Query(QueryRequest),
    /// `SYNC_PULL`.
    SyncPull(SyncPullRequest),
}

impl Request {
    /// Opcode used to send this request.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Validate(_) => Opcode::ConnectValidate,
            Request::RegisterStorage(_) => Opcode::RegisterStorage,
            Request::RegisterFile(_) => Opcode::RegisterFile,
            Request::Upload(_) => Opcode::Upload,
            Request::Download(_) => Opcode::Download,
            Request::Query(_) => Opcode::Query,
            Request::SyncPull(_) => Opcode::SyncPull,
        }
    }

    /// Serialize the meta record.
    pub fn encode_meta(&self) -> Result<Vec<u8>, NetError> {
        match self {
            Request::Validate(m) => encode_meta(m),
            Request::RegisterStorage(m) => encode_meta(m),
            Request::RegisterFile(m) => encode_meta(m),
            Request::Upload(m) => encode_meta(m),
            Request::Download(m) => encode_meta(m),
            Request::Query(m) => encode_meta(m),
            Request::SyncPull(m) => encode_meta(m),
        }
    }

    /// Write the request frame. The caller streams `body_len` bytes
    /// afterwards (uploads only).
    pub async fn write_to<W>(&self, writer: &mut W, body_len: u64) -> Result<(), NetError>
    where
        W: AsyncWrite + Unpin,
    {
        let meta = self.encode_meta()?;
        write_raw_frame(writer, self.opcode(), &meta, body_len).await
    }

    /// Decode a received frame into a typed request.
    ///
    /// A `RESPONSE` frame where a request is expected is a framing error, as
    /// is an upload whose declared size disagrees with the body length.
    pub fn from_frame(frame: &Frame) -> Result<Self, NetError> {
        let request = match frame.opcode() {
            Opcode::ConnectValidate => Request::Validate(frame.decode_meta()?),
            Opcode::RegisterStorage => Request::RegisterStorage(frame.decode_meta()?),
            Opcode::RegisterFile => Request::RegisterFile(frame.decode_meta()?),
            Opcode::Upload => {
                let upload: UploadRequest = frame.decode_meta()?;
                if upload.file_size != frame.body_len() {
                    return Err(NetError::ProtocolFraming(format!(
                        "upload declares {} bytes but body is {} bytes",
                        upload.file_size,
                        frame.body_len()
                    )));
                }
                Request::Upload(upload)
            }
            Opcode::Download => Request::Download(frame.decode_meta()?),
            Opcode::Query => Request::Query(frame.decode_meta()?),
            Opcode::SyncPull => Request::SyncPull(frame.decode_meta()?),
            Opcode::Response => {
                return Err(NetError::ProtocolFraming(
                    "response frame received where a request was expected".to_string(),
                ));
            }
        };
        Ok(request)
    }
}
