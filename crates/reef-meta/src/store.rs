//! [`MetaStore`] implementation wrapping Fjall keyspaces.

use std::path::Path;
use std::sync::Mutex;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use reef_types::{Digest, FileRecord, InstanceId, PartMeta};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Secrets remembered per instance.
pub const MAX_SECRET_HISTORY: usize = 8;

/// Existence-index entry for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Total size in bytes.
    pub size: u64,
    /// Part layout (a single part for whole-object uploads).
    pub parts: Vec<PartMeta>,
}

/// Metadata store backed by Fjall.
pub struct MetaStore {
    #[allow(dead_code)]
    db: Database,
    /// Digest → serialized [`IndexEntry`].
    objects: Keyspace,
    /// Instance id → serialized `Vec<String>`.
    secrets: Keyspace,
    /// Catalog id (8 bytes BE) → serialized [`FileRecord`].
    files: Keyspace,
    /// Name → u64 BE.
    cursors: Keyspace,
    /// Serializes read-modify-write sequences (catalog id assignment,
    /// secret history updates).
    write_lock: Mutex<()>,
    /// Keeps the backing directory of a temporary store alive.
    _tmp: Option<TempDir>,
}

impl MetaStore {
    /// Open a persistent MetaStore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db, None)
    }

    /// Open a temporary MetaStore that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db, Some(tmp))
    }

    fn init_keyspaces(db: Database, tmp: Option<TempDir>) -> Result<Self> {
        let objects = db.keyspace("objects", KeyspaceCreateOptions::default)?;
        let secrets = db.keyspace("secrets", KeyspaceCreateOptions::default)?;
        let files = db.keyspace("files", KeyspaceCreateOptions::default)?;
        let cursors = db.keyspace("cursors", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            objects,
            secrets,
            files,
            cursors,
            write_lock: Mutex::new(()),
            _tmp: tmp,
        })
    }

    // ----- Existence index -----

    /// Record that an object is stored.
    pub fn record(&self, digest: &Digest, entry: &IndexEntry) -> Result<()> {
        let value = postcard::to_allocvec(entry)?;
        self.objects.insert(digest.as_bytes(), value.as_slice())?;
        debug!(%digest, size = entry.size, "indexed object");
        Ok(())
    }

    /// Index entry for a digest, if recorded.
    pub fn lookup(&self, digest: &Digest) -> Result<Option<IndexEntry>> {
        match self.objects.get(digest.as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether a digest is recorded in the index.
    pub fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.objects.get(digest.as_bytes())?.is_some())
    }

    // ----- Secret history -----

    /// Append `secret` to the history of `id`.
    ///
    /// Returns `true` when the instance previously registered with a
    /// different secret (a rotation). Re-recording the most recent secret is
    /// a no-op. The history is capped at [`MAX_SECRET_HISTORY`] entries,
    /// oldest dropped first.
    pub fn record_secret(&self, id: &InstanceId, secret: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().expect("meta write lock poisoned");

        let mut history = self.known_secrets(id)?;
        if history.last().is_some_and(|last| last == secret) {
            return Ok(false);
        }
        let rotated = !history.is_empty();

        history.retain(|s| s != secret);
        history.push(secret.to_string());
        if history.len() > MAX_SECRET_HISTORY {
            let excess = history.len() - MAX_SECRET_HISTORY;
            history.drain(..excess);
        }

        let value = postcard::to_allocvec(&history)?;
        self.secrets.insert(id.as_str().as_bytes(), value.as_slice())?;
        if rotated {
            info!(%id, generations = history.len(), "instance secret rotated");
        }
        Ok(rotated)
    }

    /// Secrets an instance has registered with, most recent last.
    pub fn known_secrets(&self, id: &InstanceId) -> Result<Vec<String>> {
        match self.secrets.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    // ----- File catalog -----

    /// Append a file to the catalog, assigning the next id.
    ///
    /// Ids start at 1 and strictly increase; the `id` field of `file` is
    /// ignored.
    pub fn append_file(&self, file: &FileRecord) -> Result<u64> {
        let _guard = self.write_lock.lock().expect("meta write lock poisoned");

        let next = match self.files.last_key_value() {
            Some(guard) => catalog_id(&guard.key()?)? + 1,
            None => 1,
        };

        let mut record = file.clone();
        record.id = next;
        let value = postcard::to_allocvec(&record)?;
        self.files.insert(next.to_be_bytes(), value.as_slice())?;
        debug!(id = next, md5 = %record.md5, instance = %record.instance, "catalogued file");
        Ok(next)
    }

    /// First catalog entry with an id greater than `last_id`.
    pub fn next_file_after(&self, last_id: u64) -> Result<Option<FileRecord>> {
        let Some(start) = last_id.checked_add(1) else {
            return Ok(None);
        };
        match self.files.range(start.to_be_bytes()..).next() {
            Some(guard) => {
                let value = guard.value()?;
                Ok(Some(postcard::from_bytes(&value)?))
            }
            None => Ok(None),
        }
    }

    /// Number of catalogued files.
    ///
    /// Note: this is an O(n) scan.
    pub fn catalog_len(&self) -> Result<usize> {
        let mut count = 0;
        for guard in self.files.iter() {
            let _ = guard.key()?;
            count += 1;
        }
        Ok(count)
    }

    // ----- Cursors -----

    /// Read a named cursor (0 when never set).
    pub fn get_cursor(&self, name: &str) -> Result<u64> {
        match self.cursors.get(name.as_bytes())? {
            Some(bytes) => catalog_id(&bytes),
            None => Ok(0),
        }
    }

    /// Persist a named cursor.
    pub fn set_cursor(&self, name: &str, value: u64) -> Result<()> {
        self.cursors.insert(name.as_bytes(), value.to_be_bytes())?;
        Ok(())
    }
}

/// Decode an 8-byte big-endian id.
fn catalog_id(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| MetaError::CorruptKey {
        keyspace: "files",
        len: bytes.len(),
    })?;
    Ok(u64::from_be_bytes(arr))
}
