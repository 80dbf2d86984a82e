//! Diff resolution between a requester's fingerprints and an authoritative tree

use crate::fingerprint::{hash_file, walk_tree};
use crate::ignore::IgnoreSet;
use crate::memo::HashMemo;
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};
use treesync_types::{DiffEntry, DiffMap, Error, Fingerprints, Result};

/// Permission bits of a file
#[cfg(unix)]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Permission bits of a file
#[cfg(not(unix))]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Computes which files a requester is missing or has stale
///
/// Only files present on the authoritative side are reported. A file the
/// requester has but the server does not is left alone: deletions are never
/// propagated.
#[derive(Debug, Clone)]
pub struct DiffResolver {
    root: PathBuf,
    ignore: IgnoreSet,
    memo: Option<Arc<HashMemo>>,
    recursive: bool,
}

impl DiffResolver {
    /// Resolver over the authoritative tree at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ignore: IgnoreSet::empty(),
            memo: None,
            recursive: true,
        }
    }

    /// Never offer files matching `ignore`
    pub fn with_ignore(mut self, ignore: IgnoreSet) -> Self {
        self.ignore = ignore;
        self
    }

    /// Reuse hashes of unchanged files across requests
    pub fn with_memo(mut self, memo: Arc<HashMemo>) -> Self {
        self.memo = Some(memo);
        self
    }

    /// Only compare the root's direct children
    pub fn non_recursive(mut self) -> Self {
        self.recursive = false;
        self
    }

    /// Authoritative root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Diff the authoritative tree against `client`
    ///
    /// Fails with a read error on the first unreadable directory or file; no
    /// partial diff is returned.
    pub fn resolve(&self, client: &Fingerprints) -> Result<DiffMap> {
        let mut diff = DiffMap::new();

        for file in walk_tree(&self.root, &self.ignore, self.recursive)? {
            let new_hash = match &self.memo {
                Some(memo) => memo.hash_file(&file.path, &file.metadata),
                None => hash_file(&file.path),
            }
            .map_err(|e| Error::read(&file.path, e))?;

            let old_hash = client.get(&file.relative);
            if old_hash == Some(&new_hash) {
                continue;
            }

            debug!(
                "Changed: {} ({} -> {})",
                file.relative,
                old_hash.map_or("<none>", String::as_str),
                new_hash
            );

            let modified = file
                .metadata
                .modified()
                .map_err(|e| Error::read(&file.path, e))?;
            diff.insert(
                file.relative,
                DiffEntry {
                    new_hash,
                    old_hash: old_hash.cloned(),
                    new_size: file.metadata.len(),
                    mode: permission_bits(&file.metadata),
                    mod_time: to_utc(modified),
                },
            );
        }

        info!(
            "Resolved {} changed file(s) under {}",
            diff.len(),
            self.root.display()
        );
        Ok(diff)
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
