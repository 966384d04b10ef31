//! Storage collaborator — where reassembled payloads go.
//!
//! The engine hands over bytes plus the declared type and keeps only the
//! returned location string. The default implementation is a
//! content-addressed directory tree:
//!
//!   {root}/{hash[0..2]}/{full_hash}
//!
//! the same two-level layout Git uses for objects. Files are immutable —
//! if the hash exists, the content is already there. No TTLs, no
//! invalidation.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;
use memmap2::Mmap;

/// The boundary the engine consumes. Implementations must be cheap to
/// call from the engine task — a slow store stalls frame processing.
pub trait BinaryStore: Send + Sync + 'static {
    /// Persist a reassembled payload, returning a stable location string.
    fn store(&self, original_type: &str, bytes: &[u8]) -> Result<String, StorageError>;
}

/// Content-addressed on-disk store.
#[derive(Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StorageError::Io(root.clone(), e))?;
        Ok(Self { root })
    }

    /// Read a stored payload back by its location string.
    ///
    /// Returns None if not present. The read is mmap-backed, so page
    /// faults bring data from disk on demand.
    pub fn get(&self, location: &str) -> Result<Option<Bytes>, StorageError> {
        let path = PathBuf::from(location);
        if !path.exists() {
            return Ok(None);
        }
        let file = fs::File::open(&path).map_err(|e| StorageError::Io(path.clone(), e))?;
        // Safety: file is opened read-only and we don't mutate the mmap
        let mmap = unsafe { Mmap::map(&file).map_err(|e| StorageError::Io(path.clone(), e))? };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    fn payload_path(&self, hash: &[u8; 32]) -> PathBuf {
        let hex = hex::encode(hash);
        self.root.join(&hex[0..2]).join(&hex)
    }

    /// Count stored payloads (for stats/debugging).
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir.count();
                }
            }
        }
        total
    }
}

impl BinaryStore for DiskStore {
    /// Atomic write: temp file, sync, then rename. Idempotent — storing
    /// the same bytes twice finds the file already in place.
    fn store(&self, original_type: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let hash = *blake3::hash(bytes).as_bytes();
        let path = self.payload_path(&hash);

        if path.exists() {
            return Ok(path.display().to_string());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::Io(parent.to_path_buf(), e))?;
        }

        let tmp_path = path.with_extension("tmp");
        {
            let mut file =
                fs::File::create(&tmp_path).map_err(|e| StorageError::Io(tmp_path.clone(), e))?;
            file.write_all(bytes)
                .map_err(|e| StorageError::Io(tmp_path.clone(), e))?;
            file.sync_all()
                .map_err(|e| StorageError::Io(tmp_path.clone(), e))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| StorageError::Io(path.clone(), e))?;

        tracing::trace!(
            hash = hex::encode(hash),
            original_type,
            bytes = bytes.len(),
            "payload stored"
        );
        Ok(path.display().to_string())
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage i/o at {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

// ── Tests ────────────────────────────────────────────────────────────────────
