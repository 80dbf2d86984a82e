//! Patch archives: packing changed files and applying them to a tree
//!
//! A patch is a gzip-compressed tar stream with one regular-file record per
//! diff entry. Record headers carry the path, size, mode and mtime recorded in
//! the diff, so the archive always describes the diff that was computed and
//! not whatever the filesystem looks like at pack time.

use crate::cache::HotCache;
use crate::fingerprint::{hash_bytes, relative_slash_path};
use crate::hidden::HideFile;
use crate::ignore::IgnoreSet;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use treesync_types::{ApplyFailure, DiffEntry, DiffMap, Error, Result};
use walkdir::WalkDir;
use xxhash_rust::xxh3::Xxh3;

/// Suffix of files moved aside when their destination could not be overwritten
pub const TEMP_SUFFIX: &str = ".autoupdatetmpfile";

/// How long a built archive stays in the hot cache after its last visit
pub const ARCHIVE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Identity key of the archive for `diff`
///
/// Hashes every `(path, new hash)` pair in path order, so two diffs with the
/// same changed files and contents share a key however they were built.
pub fn archive_key(diff: &DiffMap) -> String {
    let mut hasher = Xxh3::new();
    for (path, entry) in diff {
        hasher.update(path.as_bytes());
        hasher.update(&[0]);
        hasher.update(entry.new_hash.as_bytes());
        hasher.update(&[0]);
    }
    format!("{:032x}", hasher.digest128())
}

/// File name of the archive for `diff`
pub fn archive_name(diff: &DiffMap) -> String {
    format!("{}{}", archive_key(diff), ARCHIVE_EXTENSION)
}

fn is_archive_name(name: &str) -> bool {
    name.strip_suffix(ARCHIVE_EXTENSION)
        .is_some_and(|key| !key.is_empty() && key.chars().all(|c| c.is_ascii_hexdigit()))
}

/// A built or cached patch archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedPatch {
    /// Archive file name, `<key>.tar.gz`
    pub name: String,
    /// Compressed archive bytes
    pub bytes: Bytes,
}

impl PackedPatch {
    /// Compressed size in bytes
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Builds patch archives, reusing earlier builds through the hot cache
///
/// Built archives are also written to `cache_dir`, so a download that arrives
/// after the cache evicted the archive can still be served.
#[derive(Debug, Clone)]
pub struct PatchArchiver {
    cache: Arc<HotCache>,
    cache_dir: PathBuf,
    ttl: Duration,
}

impl PatchArchiver {
    /// Archiver storing into `cache` and persisting under `cache_dir`
    pub fn new<P: AsRef<Path>>(cache: Arc<HotCache>, cache_dir: P) -> Self {
        Self {
            cache,
            cache_dir: cache_dir.as_ref().to_path_buf(),
            ttl: ARCHIVE_TTL,
        }
    }

    /// Override the cache TTL of built archives
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Directory archives are persisted to
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Archive for `diff` with content taken from `root`
    ///
    /// Looks in the hot cache, then in the cache directory, and only builds
    /// when both miss. Concurrent first requests for the same diff may both
    /// build; the contents are identical and the last store wins.
    pub fn pack<P: AsRef<Path>>(&self, root: P, diff: &DiffMap) -> Result<PackedPatch> {
        let name = archive_name(diff);

        if let Some(bytes) = self.load(&name)? {
            debug!("Reusing patch archive {}", name);
            return Ok(PackedPatch { name, bytes });
        }

        let bytes = Bytes::from(build_archive(root.as_ref(), diff)?);
        self.persist(&name, &bytes)?;
        self.cache.put(name.clone(), bytes.clone(), self.ttl);

        info!(
            "Built patch archive {} ({} file(s), {} bytes)",
            name,
            diff.len(),
            bytes.len()
        );
        Ok(PackedPatch { name, bytes })
    }

    /// Previously built archive by file name
    ///
    /// A hit on disk is put back into the hot cache. Names that are not
    /// archive names are never looked up.
    pub fn load(&self, name: &str) -> Result<Option<Bytes>> {
        if !is_archive_name(name) {
            return Ok(None);
        }

        if let Some(bytes) = self.cache.get(name) {
            return Ok(Some(bytes));
        }

        let path = self.cache_dir.join(name);
        match fs::read(&path) {
            Ok(content) => {
                debug!("Reloaded patch archive {} from disk", name);
                let bytes = Bytes::from(content);
                self.cache.put(name.to_string(), bytes.clone(), self.ttl);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::read(path, e)),
        }
    }

    fn persist(&self, name: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.cache_dir).map_err(|e| Error::write(&self.cache_dir, e))?;

        let target = self.cache_dir.join(name);
        let partial = self
            .cache_dir
            .join(format!(".{}.{}.partial", name, uuid::Uuid::new_v4()));

        fs::write(&partial, bytes).map_err(|e| Error::write(&partial, e))?;
        if let Err(e) = fs::rename(&partial, &target) {
            let _ = fs::remove_file(&partial);
            return Err(Error::write(&target, e));
        }
        Ok(())
    }
}

fn build_archive(root: &Path, diff: &DiffMap) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (relative, entry) in diff {
        let path = root.join(relative);
        let content = fs::read(&path).map_err(|e| Error::read(&path, e))?;

        if content.len() as u64 != entry.new_size {
            return Err(Error::protocol(format!(
                "'{}' changed since the diff: expected {} bytes, found {}",
                relative,
                entry.new_size,
                content.len()
            )));
        }
        let actual = hash_bytes(&content);
        if actual != entry.new_hash {
            return Err(Error::hash_mismatch(relative, &entry.new_hash, &actual));
        }

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(entry.new_size);
        header.set_mode(entry.mode);
        header.set_mtime(entry.mod_time.timestamp().max(0) as u64);
        builder.append_data(&mut header, relative, content.as_slice())?;
    }

    Ok(builder.into_inner()?.finish()?)
}

/// Path a blocked file is moved to before being recreated
fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    dest.with_file_name(name)
}

/// Write `content` to `dest` and restore its mode and mtime
///
/// The file is truncated and rewritten in place. When that fails (typically a
/// running executable on Windows) the existing file is renamed aside to
/// `<name>.autoupdatetmpfile`, hidden, and `dest` is created fresh. If that
/// fails too, the original name is restored and a write error is returned.
pub fn replace_file(
    dest: &Path,
    content: &[u8],
    mode: u32,
    mtime: FileTime,
    hide: &dyn HideFile,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::write(parent, e))?;
    }

    if let Err(first) = fs::write(dest, content) {
        if fs::symlink_metadata(dest).is_ok_and(|metadata| metadata.is_dir()) {
            return Err(Error::write(dest, first));
        }
        warn!(
            "Cannot overwrite {} ({}), moving it aside",
            dest.display(),
            first
        );

        let aside = temp_path_for(dest);
        fs::rename(dest, &aside).map_err(|e| {
            Error::write(dest, format!("{}; moving aside failed: {}", first, e))
        })?;
        if let Err(e) = hide.hide(&aside) {
            debug!("Could not hide {}: {}", aside.display(), e);
        }

        if let Err(second) = fs::write(dest, content) {
            let _ = fs::remove_file(dest);
            if let Err(e) = fs::rename(&aside, dest) {
                warn!(
                    "Could not restore {} from {}: {}",
                    dest.display(),
                    aside.display(),
                    e
                );
            }
            return Err(Error::write(dest, second));
        }
    }

    set_mode(dest, mode)?;
    filetime::set_file_mtime(dest, mtime).map_err(|e| Error::write(dest, e))?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(dest: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dest, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| Error::write(dest, e))
}

#[cfg(not(unix))]
fn set_mode(_dest: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Modification time of a diff entry as a file time
pub fn file_time(mod_time: &DateTime<Utc>) -> FileTime {
    FileTime::from_unix_time(mod_time.timestamp(), mod_time.timestamp_subsec_nanos())
}

/// Relative slash path of `path`, rejecting anything that could escape a target root
///
/// Absolute paths, drive prefixes and `..` components are protocol errors.
pub fn safe_relative_path(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                Error::protocol(format!("non UTF-8 path: '{}'", path.display()))
            })?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::protocol(format!(
                    "unsafe relative path: '{}'",
                    path.display()
                )));
            }
        }
    }

    if parts.is_empty() {
        return Err(Error::protocol("empty relative path"));
    }
    Ok(parts.join("/"))
}

/// Apply a patch archive read from `reader` onto `target`
///
/// Records are applied in stream order. A record whose path matches `ignore`
/// is skipped when the destination already exists. Content is checked against
/// the diff's hash before anything is written, and mode and mtime come from
/// the diff entry, or from the record header for paths the diff does not
/// know.
///
/// Returns the number of files written. On failure, files written so far stay
/// written and their count is reported in the [`ApplyFailure`].
pub fn apply_patch<R: Read>(
    target: &Path,
    reader: R,
    diff: &DiffMap,
    ignore: &IgnoreSet,
    hide: &dyn HideFile,
) -> std::result::Result<usize, ApplyFailure> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let entries = archive
        .entries()
        .map_err(|e| ApplyFailure::new(0, Error::protocol(format!("unreadable patch archive: {}", e))))?;

    let mut applied = 0;
    for entry in entries {
        let written = entry
            .map_err(|e| Error::protocol(format!("corrupt patch archive: {}", e)))
            .and_then(|mut entry| apply_record(target, &mut entry, diff, ignore, hide));

        match written {
            Ok(true) => applied += 1,
            Ok(false) => {}
            Err(error) => return Err(ApplyFailure::new(applied, error)),
        }
    }

    info!("Applied {} file(s) to {}", applied, target.display());
    Ok(applied)
}

fn apply_record<R: Read>(
    target: &Path,
    entry: &mut tar::Entry<'_, R>,
    diff: &DiffMap,
    ignore: &IgnoreSet,
    hide: &dyn HideFile,
) -> Result<bool> {
    if !entry.header().entry_type().is_file() {
        return Ok(false);
    }

    let raw_path = entry
        .path()
        .map_err(|e| Error::protocol(format!("invalid path in patch archive: {}", e)))?
        .into_owned();
    let relative = safe_relative_path(&raw_path)?;
    let dest = target.join(&relative);

    if ignore.is_ignored(&relative) && dest.exists() {
        debug!("Keeping local copy of ignored {}", relative);
        return Ok(false);
    }

    let declared = entry.size();
    let known: Option<&DiffEntry> = diff.get(&relative);
    if let Some(expected) = known {
        if declared != expected.new_size {
            return Err(Error::protocol(format!(
                "record '{}' declares {} bytes, expected {}",
                relative, declared, expected.new_size
            )));
        }
    }

    // Header sizes are untrusted; the buffer grows only with bytes actually read
    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|e| Error::protocol(format!("truncated record '{}': {}", relative, e)))?;
    if content.len() as u64 != declared {
        return Err(Error::protocol(format!(
            "truncated record '{}': read {} of {} bytes",
            relative,
            content.len(),
            declared
        )));
    }

    let (mode, mtime) = match known {
        Some(expected) => {
            let actual = hash_bytes(&content);
            if actual != expected.new_hash {
                return Err(Error::hash_mismatch(&relative, &expected.new_hash, &actual));
            }
            (expected.mode, file_time(&expected.mod_time))
        }
        None => {
            let header = entry.header();
            let mode = header
                .mode()
                .map_err(|e| Error::protocol(format!("bad mode for '{}': {}", relative, e)))?;
            let mtime = header
                .mtime()
                .map_err(|e| Error::protocol(format!("bad mtime for '{}': {}", relative, e)))?;
            (mode, FileTime::from_unix_time(mtime as i64, 0))
        }
    };

    replace_file(&dest, &content, mode, mtime, hide)?;
    debug!("Wrote {} ({} bytes)", relative, content.len());
    Ok(true)
}

/// Remove `*.autoupdatetmpfile` leftovers of earlier applies under `root`
///
/// Files that vanish before they can be deleted are not an error. A missing
/// root has nothing to clean.
pub fn clean_temp_files<P: AsRef<Path>>(root: P) -> Result<usize> {
    let root = root.as_ref();
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            Error::read(path, e)
        })?;
        if !entry.file_type().is_file() || !entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => {
                removed += 1;
                debug!(
                    "Removed leftover {}",
                    relative_slash_path(root, entry.path()).unwrap_or_default()
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::write(entry.path(), e)),
        }
    }

    if removed > 0 {
        info!("Removed {} leftover temp file(s) under {}", removed, root.display());
    }
    Ok(removed)
}
