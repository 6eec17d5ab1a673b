//! File-based object store.

use std::path::{Path, PathBuf};

use reef_net::receive_body;
use reef_types::Digest;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::StoreError;

/// Name of the staging directory under the base directory.
const TMP_DIR: &str = "tmp";

/// Outcome of committing a staged object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The object was moved to its canonical path.
    Stored,
    /// An object with the same digest already existed; the staged copy was
    /// discarded.
    Deduplicated,
}

/// Result of [`ObjectStore::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Digest of the received content.
    pub digest: Digest,
    /// Number of bytes received.
    pub size: u64,
    /// Whether the content was newly stored or already present.
    pub placement: Placement,
}

/// Removes a staged file on drop unless disarmed.
struct TmpGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for TmpGuard {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove staged file");
        }
    }
}

/// Content in transit: an open temporary file under `{base_dir}/tmp/`.
///
/// Dropping a staged object without committing it deletes the file.
pub struct StagedObject {
    file: File,
    guard: TmpGuard,
}

impl StagedObject {
    /// Writable handle to the staged file.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Path of the staged file.
    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    /// Close and delete the staged file.
    pub async fn discard(self) {
        let StagedObject { file, mut guard } = self;
        drop(file);
        match tokio::fs::remove_file(&guard.path).await {
            Ok(()) => guard.armed = false,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => guard.armed = false,
            // Leave the guard armed so drop retries.
            Err(e) => warn!(path = %guard.path.display(), error = %e, "failed to discard staged file"),
        }
    }
}

impl std::fmt::Debug for StagedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedObject")
            .field("path", &self.guard.path)
            .finish()
    }
}

/// Canonical relative path of an object: `XX/YY/<hex>`.
pub fn relative_path(digest: &Digest) -> String {
    let hex = digest.to_hex();
    let upper = hex.to_ascii_uppercase();
    format!("{}/{}/{hex}", &upper[0..2], &upper[2..4])
}

/// Turn a bare digest or a returned path (`XX/YY/<hex>[.<ext>]`) into a
/// digest.
pub fn resolve(path_or_md5: &str) -> Result<Digest, StoreError> {
    let invalid = || StoreError::InvalidPath(path_or_md5.to_string());

    let trimmed = path_or_md5.trim().trim_start_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    let name = match segments.as_slice() {
        [name] | [_, _, name] => *name,
        _ => return Err(invalid()),
    };
    let hex = name.split_once('.').map_or(name, |(stem, _)| stem);
    let digest = Digest::from_hex(hex).ok_or_else(invalid)?;

    if segments.len() == 3 {
        let upper = digest.to_hex().to_ascii_uppercase();
        if !segments[0].eq_ignore_ascii_case(&upper[0..2])
            || !segments[1].eq_ignore_ascii_case(&upper[2..4])
        {
            return Err(invalid());
        }
    }
    Ok(digest)
}

/// Object store rooted at a base directory.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    base_dir: PathBuf,
}

impl ObjectStore {
    /// Open a store rooted at `base_dir`, creating it and its staging
    /// directory if needed.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(base_dir.join(TMP_DIR))?;
        Ok(Self { base_dir })
    }

    /// Root directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Absolute path of the object with `digest`.
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        let upper = hex.to_ascii_uppercase();
        self.base_dir.join(&upper[0..2]).join(&upper[2..4]).join(hex)
    }

    /// Create a new staged file.
    pub async fn stage(&self) -> Result<StagedObject, StoreError> {
        let name = format!("{:016x}", rand::random::<u64>());
        let path = self.base_dir.join(TMP_DIR).join(name);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(StagedObject {
            file,
            guard: TmpGuard { path, armed: true },
        })
    }

    /// Move a staged file to the canonical path for `digest`.
    ///
    /// The object is linked into place with an operation that fails when the
    /// destination exists, so concurrent commits of one digest store it
    /// exactly once. The staged file is deleted either way.
    pub async fn commit(
        &self,
        staged: StagedObject,
        digest: Digest,
    ) -> Result<Placement, StoreError> {
        let StagedObject { mut file, mut guard } = staged;
        file.flush().await?;
        drop(file);

        let dest = self.object_path(&digest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let placement = match tokio::fs::hard_link(&guard.path, &dest).await {
            Ok(()) => Placement::Stored,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Placement::Deduplicated,
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = tokio::fs::remove_file(&guard.path).await {
            warn!(path = %guard.path.display(), error = %e, "failed to remove staged file");
        }
        guard.armed = false;

        match placement {
            Placement::Stored => debug!(%digest, path = %dest.display(), "stored object"),
            Placement::Deduplicated => debug!(%digest, "object already stored, staged copy discarded"),
        }
        Ok(placement)
    }

    /// Stage, stream `len` bytes from `reader`, verify and commit.
    ///
    /// When `expected` is given the received digest must match it. Any
    /// failure deletes the staged file; nothing is left at a stable path.
    pub async fn receive<R>(
        &self,
        reader: &mut R,
        len: u64,
        buf_size: usize,
        expected: Option<Digest>,
    ) -> Result<Received, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut staged = self.stage().await?;

        let digest = match receive_body(reader, staged.file_mut(), len, buf_size).await {
            Ok(digest) => digest,
            Err(e) => {
                staged.discard().await;
                return Err(StoreError::Transfer(e));
            }
        };

        if let Some(expected) = expected
            && expected != digest
        {
            staged.discard().await;
            return Err(StoreError::DigestMismatch {
                expected,
                actual: digest,
            });
        }

        let placement = self.commit(staged, digest).await?;
        Ok(Received {
            digest,
            size: len,
            placement,
        })
    }

    /// Open an object for reading, with its size.
    pub async fn open(&self, digest: &Digest) -> Result<Option<(File, u64)>, StoreError> {
        match File::open(self.object_path(digest)).await {
            Ok(file) => {
                let size = file.metadata().await?.len();
                Ok(Some((file, size)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Whether an object is stored.
    pub async fn contains(&self, digest: &Digest) -> Result<bool, StoreError> {
        Ok(self.size(digest).await?.is_some())
    }

    /// Size of a stored object.
    pub async fn size(&self, digest: &Digest) -> Result<Option<u64>, StoreError> {
        match tokio::fs::metadata(self.object_path(digest)).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Every stored digest (staging directory excluded).
    pub async fn list(&self) -> Result<Vec<Digest>, StoreError> {
        let mut digests = Vec::new();

        let mut level0 = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(d0) = level0.next_entry().await? {
            if !d0.file_type().await?.is_dir() || d0.file_name() == TMP_DIR {
                continue;
            }
            let mut level1 = tokio::fs::read_dir(d0.path()).await?;
            while let Some(d1) = level1.next_entry().await? {
                if !d1.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = tokio::fs::read_dir(d1.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    if !entry.file_type().await?.is_file() {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str()
                        && let Some(digest) = Digest::from_hex(name)
                    {
                        digests.push(digest);
                    }
                }
            }
        }
        Ok(digests)
    }

    /// Number of files currently staged.
    pub async fn staged_count(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(self.base_dir.join(TMP_DIR)).await?;
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}
