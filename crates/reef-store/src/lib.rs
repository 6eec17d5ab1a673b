//! Content-addressed object placement.
//!
//! Objects are stored one file per digest under a 2-level fan-out:
//! `{base_dir}/{HEX[0..2]}/{HEX[2..4]}/{hex}`, directory segments uppercase
//! and the file name lowercase. Incoming content is staged under
//! `{base_dir}/tmp/` and only moved to its final path once it has been
//! received and digested in full.

mod error;
mod object_store;

pub use error::StoreError;
pub use object_store::{ObjectStore, Placement, Received, StagedObject, relative_path, resolve};
