//! Metadata persistence layer wrapping Fjall.
//!
//! [`MetaStore`] provides typed accessors over four Fjall keyspaces:
//!
//! - `objects`: [`Digest`](reef_types::Digest) → [`IndexEntry`]: existence
//!   index of a storage node. The object store on disk stays the source of
//!   truth; a missing index entry only means "look on disk".
//! - `secrets`: instance id → secret history, most recent last.
//! - `files`: catalog id (8 bytes BE) → [`FileRecord`](reef_types::FileRecord),
//!   the tracker's ordered file catalog.
//! - `cursors`: name → u64, e.g. a storage node's sync position.

mod error;
mod store;

pub use error::MetaError;
pub use store::{IndexEntry, MAX_SECRET_HISTORY, MetaStore};
