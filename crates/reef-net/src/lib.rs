//! Wire protocol and outbound connection management.
//!
//! This crate implements Reef's network layer on plain TCP:
//!
//! - [`codec`]: the 18-byte frame preamble, exact-length frame reads and
//!   the opcode table.
//! - [`message`]: postcard-encoded meta records carried by each opcode.
//! - [`transfer`]: chunked body streaming with MD5 digesting.
//! - [`ConnectionPool`]: per-destination idle cache with admission control,
//!   address failover and idle hygiene.

pub mod codec;
mod error;
pub mod message;
mod pool;
pub mod transfer;

pub use codec::{
    Frame, FrameHeader, HEADER_LEN, MAX_META_SIZE, Opcode, encode_frame, encode_meta, read_frame,
    read_frame_or_eof, write_frame, write_raw_frame,
};
pub use error::NetError;
pub use message::{Request, Status};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConn};
pub use transfer::{DEFAULT_BUFFER_SIZE, receive_body, send_body};
