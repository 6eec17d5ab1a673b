//! Frame codec.
//!
//! Every message is `[2B opcode][8B BE meta-len][8B BE body-len][meta][body?]`.
//! The receiver reads exactly the declared number of bytes for each section;
//! anything else is a [`NetError::ProtocolFraming`] and the connection is
//! dropped. Bodies are never read here: callers stream them with
//! [`crate::transfer`] after inspecting the header.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;
use crate::message::StatusResponse;

/// Size of the fixed frame preamble.
pub const HEADER_LEN: usize = 18;

/// Largest meta payload accepted from a peer: 4 MiB.
pub const MAX_META_SIZE: u64 = 4 * 1024 * 1024;

/// Protocol operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Present the shared secret; must precede other requests.
    ConnectValidate = 1,
    /// Storage node registration / heartbeat with a tracker.
    RegisterStorage = 2,
    /// Report a stored file to the tracker catalog.
    RegisterFile = 3,
    /// Store a file; the body carries the content.
    Upload = 4,
    /// Fetch a stored file; the response body carries the content.
    Download = 5,
    /// Existence and size lookup.
    Query = 6,
    /// Fetch the next catalog entry after a cursor.
    SyncPull = 7,
    /// Reply to any request; may carry a body.
    Response = 8,
}

impl Opcode {
    /// Wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether frames with this opcode may be followed by a body.
    pub fn carries_body(self) -> bool {
        matches!(self, Opcode::Upload | Opcode::Response)
    }
}

impl TryFrom<u16> for Opcode {
    type Error = NetError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Opcode::ConnectValidate,
            2 => Opcode::RegisterStorage,
            3 => Opcode::RegisterFile,
            4 => Opcode::Upload,
            5 => Opcode::Download,
            6 => Opcode::Query,
            7 => Opcode::SyncPull,
            8 => Opcode::Response,
            other => {
                return Err(NetError::ProtocolFraming(format!(
                    "unsupported opcode {other:#06x}"
                )));
            }
        })
    }
}

/// The fixed 18-byte frame preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Operation carried by the frame.
    pub opcode: Opcode,
    /// Exact number of meta bytes that follow the header.
    pub meta_len: u64,
    /// Exact number of body bytes that follow the meta.
    pub body_len: u64,
}

impl FrameHeader {
    /// Encode to the wire layout.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.opcode.as_u16().to_be_bytes());
        buf[2..10].copy_from_slice(&self.meta_len.to_be_bytes());
        buf[10..18].copy_from_slice(&self.body_len.to_be_bytes());
        buf
    }

    /// Decode and validate a preamble.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, NetError> {
        let opcode = Opcode::try_from(u16::from_be_bytes([buf[0], buf[1]]))?;
        let mut meta_len = [0u8; 8];
        meta_len.copy_from_slice(&buf[2..10]);
        let mut body_len = [0u8; 8];
        body_len.copy_from_slice(&buf[10..18]);

        let header = Self {
            opcode,
            meta_len: u64::from_be_bytes(meta_len),
            body_len: u64::from_be_bytes(body_len),
        };

        if header.meta_len > MAX_META_SIZE {
            return Err(NetError::ProtocolFraming(format!(
                "meta too large: {} bytes (max {MAX_META_SIZE})",
                header.meta_len
            )));
        }
        if header.body_len > 0 && !opcode.carries_body() {
            return Err(NetError::ProtocolFraming(format!(
                "{opcode:?} cannot carry a body, got {} bytes",
                header.body_len
            )));
        }
        Ok(header)
    }
}

/// A decoded header plus its meta payload. The body, if any, is still
/// unread on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame preamble.
    pub header: FrameHeader,
    /// Raw meta bytes (postcard).
    pub meta: Vec<u8>,
}

impl Frame {
    /// Frame operation.
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Declared body length.
    pub fn body_len(&self) -> u64 {
        self.header.body_len
    }

    /// Decode the meta payload into the record expected for the opcode.
    ///
    /// A meta payload that does not decode is a framing error: the sender
    /// and receiver disagree on the protocol.
    pub fn decode_meta<T: DeserializeOwned>(&self) -> Result<T, NetError> {
        postcard::from_bytes(&self.meta).map_err(|e| {
            NetError::ProtocolFraming(format!("bad {:?} meta: {e}", self.header.opcode))
        })
    }

    /// Decode a response record.
    ///
    /// Every response record starts with its status, so the status is read
    /// first: a non-OK status becomes [`NetError::Status`] even when the
    /// sender only sent a bare [`StatusResponse`].
    pub fn decode_response<T: DeserializeOwned>(&self) -> Result<T, NetError> {
        let (head, _rest): (StatusResponse, _) = postcard::take_from_bytes(&self.meta)
            .map_err(|e| NetError::ProtocolFraming(format!("bad response status: {e}")))?;
        head.status.ok()?;
        self.decode_meta()
    }
}

/// Serialize a meta record.
pub fn encode_meta<T: Serialize>(meta: &T) -> Result<Vec<u8>, NetError> {
    postcard::to_allocvec(meta).map_err(|e| NetError::Serialization(e.to_string()))
}

/// Encode a header and meta into one buffer (the body is written separately).
pub fn encode_frame<T: Serialize>(
    opcode: Opcode,
    meta: &T,
    body_len: u64,
) -> Result<Vec<u8>, NetError> {
    let meta = encode_meta(meta)?;
    let header = FrameHeader {
        opcode,
        meta_len: meta.len() as u64,
        body_len,
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + meta.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&meta);
    Ok(buf)
}

/// Write a header and meta. The caller streams `body_len` bytes afterwards.
pub async fn write_frame<W, T>(
    writer: &mut W,
    opcode: Opcode,
    meta: &T,
    body_len: u64,
) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let meta = encode_meta(meta)?;
    write_raw_frame(writer, opcode, &meta, body_len).await
}

/// Write a header and already-encoded meta bytes.
pub async fn write_raw_frame<W>(
    writer: &mut W,
    opcode: Opcode,
    meta: &[u8],
    body_len: u64,
) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader {
        opcode,
        meta_len: meta.len() as u64,
        body_len,
    };
    writer.write_all(&header.encode()).await?;
    writer.write_all(meta).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame (header + meta).
///
/// End-of-stream anywhere inside the frame is a framing error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, NetError>
where
    R: AsyncRead + Unpin,
{
    match read_frame_or_eof(reader).await? {
        Some(frame) => Ok(frame),
        None => Err(NetError::ProtocolFraming(
            "connection closed before frame header".to_string(),
        )),
    }
}

/// Read one frame, or `None` if the peer closed the stream cleanly between
/// frames (no header byte received).
pub async fn read_frame_or_eof<R>(reader: &mut R) -> Result<Option<Frame>, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut head[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(NetError::ProtocolFraming(format!(
                "short header: {filled} of {HEADER_LEN} bytes"
            )));
        }
        filled += n;
    }

    let header = FrameHeader::decode(&head)?;

    let mut meta = vec![0u8; header.meta_len as usize];
    reader
        .read_exact(&mut meta)
        .await
        .map_err(|e| short_read(e, "meta", header.meta_len))?;

    Ok(Some(Frame { header, meta }))
}

/// Map an I/O error from an exact-length read: premature end-of-stream is a
/// framing violation, anything else stays an I/O error.
pub(crate) fn short_read(e: io::Error, section: &str, expected: u64) -> NetError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        NetError::ProtocolFraming(format!("short {section}: expected {expected} bytes"))
    } else {
        NetError::Io(e)
    }
}
