//! Memoized file hashes keyed by absolute path

use crate::fingerprint::hash_file;
use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::debug;

/// Memoized hash of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoEntry {
    /// File size when hashed
    pub size: u64,
    /// Last modified time when hashed
    pub modified: SystemTime,
    /// Content hash
    pub hash: String,
}

impl MemoEntry {
    /// Check if this entry still describes a file with the given metadata
    pub fn is_valid(&self, size: u64, modified: SystemTime) -> bool {
        self.size == size && self.modified == modified
    }
}

/// Hash memo shared by request handlers and the invalidation consumer
///
/// An entry is only used while the file's size and mtime are unchanged, so a
/// missed invalidation costs a rehash, never a wrong hash.
#[derive(Debug, Default)]
pub struct HashMemo {
    entries: Mutex<HashMap<PathBuf, MemoEntry>>,
}

impl HashMemo {
    /// Create an empty memo
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, MemoEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Memoized hash if the entry is still valid for `size` and `modified`
    pub fn get<P: AsRef<Path>>(&self, path: P, size: u64, modified: SystemTime) -> Option<String> {
        let path = path.as_ref();
        let mut entries = self.lock();

        match entries.get(path) {
            Some(entry) if entry.is_valid(size, modified) => Some(entry.hash.clone()),
            Some(_) => {
                entries.remove(path);
                debug!("Memo entry outdated for: {}", path.display());
                None
            }
            None => None,
        }
    }

    /// Remember `hash` for the file at `path`
    pub fn store<P: AsRef<Path>>(&self, path: P, size: u64, modified: SystemTime, hash: String) {
        self.lock().insert(
            path.as_ref().to_path_buf(),
            MemoEntry {
                size,
                modified,
                hash,
            },
        );
    }

    /// Forget the entry for `path`
    pub fn remove<P: AsRef<Path>>(&self, path: P) -> bool {
        self.lock().remove(path.as_ref()).is_some()
    }

    /// Forget everything
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of memoized files
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is memoized
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Hash of the file at `path`, memoized against `metadata`
    ///
    /// Files whose platform reports no mtime are always rehashed.
    pub fn hash_file<P: AsRef<Path>>(&self, path: P, metadata: &Metadata) -> io::Result<String> {
        let path = path.as_ref();
        let Ok(modified) = metadata.modified() else {
            return hash_file(path);
        };

        if let Some(hash) = self.get(path, metadata.len(), modified) {
            return Ok(hash);
        }

        let hash = hash_file(path)?;
        self.store(path, metadata.len(), modified, hash.clone());
        Ok(hash)
    }
}
