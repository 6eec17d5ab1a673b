//! Chunked body streaming.
//!
//! Bodies are moved in chunks of at most `buf_size` bytes and digested while
//! they pass through, so a receiver knows the content's MD5 without a second
//! pass over the data.

use reef_types::{ContentHasher, Digest};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::codec::short_read;
use crate::error::NetError;

/// Default transfer chunk size: 30 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 30 * 1024;

/// Read exactly `len` body bytes from `reader` into `sink`, hashing as they
/// arrive.
///
/// End-of-stream before `len` bytes is a [`NetError::ProtocolFraming`]; the
/// sink holds whatever arrived and the caller is expected to discard it.
pub async fn receive_body<R, W>(
    reader: &mut R,
    sink: &mut W,
    len: u64,
    buf_size: usize,
) -> Result<Digest, NetError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut hasher = ContentHasher::new();
    let mut remaining = len;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        reader
            .read_exact(&mut buf[..want])
            .await
            .map_err(|e| short_read(e, "body", len))?;
        hasher.update(&buf[..want]);
        sink.write_all(&buf[..want]).await?;
        remaining -= want as u64;
    }
    sink.flush().await?;

    let digest = hasher.finalize();
    trace!(len, %digest, "body received");
    Ok(digest)
}

/// Copy exactly `len` bytes from `source` to `writer` and return their digest.
///
/// A source that runs dry early is an I/O error: the peer was promised `len`
/// bytes and the connection can no longer be used.
pub async fn send_body<R, W>(
    source: &mut R,
    writer: &mut W,
    len: u64,
    buf_size: usize,
) -> Result<Digest, NetError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut hasher = ContentHasher::new();
    let mut remaining = len;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        source.read_exact(&mut buf[..want]).await?;
        hasher.update(&buf[..want]);
        writer.write_all(&buf[..want]).await?;
        remaining -= want as u64;
    }
    writer.flush().await?;

    Ok(hasher.finalize())
}
