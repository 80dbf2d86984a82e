//! File-tree fingerprinting, diffing and patch archives for treesync
//!
//! This crate holds the core of the update protocol:
//!
//! - **Fingerprinting**: XXH3-128 content hashes for every regular file under a root
//! - **Diff resolution**: comparing a requester's fingerprints against the authoritative tree
//! - **Patch archives**: gzip-compressed tar archives of changed files, and applying them
//! - **Hot caching**: a bounded, eviction-aware cache for archives and pre-compressed files
//! - **Change debouncing**: coalescing bursts of filesystem writes before cache invalidation
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use treesync_sync::{DiffResolver, FingerprintIndex, HotCache, IgnoreSet, PatchArchiver};
//!
//! # fn example() -> treesync_types::Result<()> {
//! let client = FingerprintIndex::build("client_dir", &IgnoreSet::empty(), true)?;
//! let diff = DiffResolver::new("server_dir").resolve(client.hashes())?;
//!
//! let archiver = PatchArchiver::new(Arc::new(HotCache::new(100)), "cache");
//! let patch = archiver.pack("server_dir", &diff)?;
//! println!("{} changed file(s) packed into {} ({} bytes)", diff.len(), patch.name, patch.size());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod cache;
pub mod debounce;
pub mod diff;
pub mod fingerprint;
pub mod hidden;
pub mod ignore;
pub mod memo;
pub mod watcher;

pub use archive::{
    apply_patch, archive_key, archive_name, clean_temp_files, file_time, replace_file,
    safe_relative_path, PackedPatch, PatchArchiver, ARCHIVE_TTL, TEMP_SUFFIX,
};
pub use cache::HotCache;
pub use debounce::{ChangeDebouncer, ChangeEvent, ChangeKind, Coalesce};
pub use diff::DiffResolver;
pub use fingerprint::{hash_bytes, hash_file, FingerprintIndex};
pub use hidden::{HideFile, NoopHide, PlatformHide};
pub use ignore::IgnoreSet;
pub use memo::HashMemo;
pub use watcher::TreeWatcher;
