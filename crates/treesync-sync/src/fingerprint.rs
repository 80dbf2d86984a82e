//! Content fingerprints of a file tree

use crate::ignore::IgnoreSet;
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use treesync_types::{Error, Fingerprints, Result, TransferMode, UpdateRequest};
use walkdir::WalkDir;
use xxhash_rust::xxh3::{xxh3_128, Xxh3};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Hash of `data` as 32 lowercase hex characters
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:032x}", xxh3_128(data))
}

/// Hash of the full contents of the file at `path`
pub fn hash_file<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:032x}", hasher.digest128()))
}

/// `path` relative to `root` with `/` separators
///
/// `None` when `path` is outside `root` or a component is not valid UTF-8.
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// A regular file found while walking a tree
#[derive(Debug)]
pub(crate) struct TreeFile {
    pub relative: String,
    pub path: PathBuf,
    pub metadata: Metadata,
}

/// Every regular file under `root` not matched by `ignore`
///
/// Directories and symlinks are skipped. Ignore patterns are checked before
/// anything is read. The first listing or metadata failure aborts the walk.
pub(crate) fn walk_tree(root: &Path, ignore: &IgnoreSet, recursive: bool) -> Result<Vec<TreeFile>> {
    let mut walker = WalkDir::new(root).min_depth(1).follow_links(false);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            Error::read(path, e)
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let Some(relative) = relative_slash_path(root, entry.path()) else {
            warn!("Skipping {}: name is not valid UTF-8", entry.path().display());
            continue;
        };
        if ignore.is_ignored(&relative) {
            debug!("Ignoring {}", relative);
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| Error::read(entry.path(), e))?;
        files.push(TreeFile {
            relative,
            path: entry.into_path(),
            metadata,
        });
    }

    Ok(files)
}

/// Mapping of every regular file under a root to its content hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintIndex {
    root: PathBuf,
    hashes: Fingerprints,
}

impl FingerprintIndex {
    /// Hash every non-ignored regular file under `root`
    ///
    /// All or nothing: a single unreadable directory or file fails the whole
    /// build, since a partial index would look like deleted files.
    pub fn build<P: AsRef<Path>>(root: P, ignore: &IgnoreSet, recursive: bool) -> Result<Self> {
        let root = root.as_ref();
        let mut hashes = Fingerprints::new();

        for file in walk_tree(root, ignore, recursive)? {
            let hash = hash_file(&file.path).map_err(|e| Error::read(&file.path, e))?;
            hashes.insert(file.relative, hash);
        }

        info!(
            "Indexed {} file(s) under {}",
            hashes.len(),
            root.display()
        );

        Ok(Self {
            root: root.to_path_buf(),
            hashes,
        })
    }

    /// Index of a directory that does not exist yet
    ///
    /// A fresh install has nothing to report, so a missing root is an empty
    /// index rather than a read error.
    pub fn build_or_empty<P: AsRef<Path>>(
        root: P,
        ignore: &IgnoreSet,
        recursive: bool,
    ) -> Result<Self> {
        let root = root.as_ref();
        match fs::metadata(root) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self {
                root: root.to_path_buf(),
                hashes: Fingerprints::new(),
            }),
            _ => Self::build(root, ignore, recursive),
        }
    }

    /// Root the index was built from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All fingerprints keyed by relative path
    pub fn hashes(&self) -> &Fingerprints {
        &self.hashes
    }

    /// Hash for one relative path
    pub fn get(&self, relative_path: &str) -> Option<&str> {
        self.hashes.get(relative_path).map(String::as_str)
    }

    /// Number of indexed files
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Whether no file was indexed
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Consume the index into its fingerprints
    pub fn into_hashes(self) -> Fingerprints {
        self.hashes
    }

    /// Wire request reporting this index
    pub fn into_request(self, mode: TransferMode) -> UpdateRequest {
        UpdateRequest::new(self.hashes).with_transfer_mode(mode)
    }
}
