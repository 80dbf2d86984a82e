//! Core wire types and error handling for treesync
//!
//! This crate provides the types shared by every other treesync crate:
//!
//! - **Error handling**: one error enum covering read, write and protocol failures
//! - **Wire types**: the JSON bodies of the update protocol and the diff map
//!
//! # Examples
//!
//! ```rust
//! use treesync_types::{UpdateRequest, Fingerprints, TransferMode};
//!
//! let mut hashes = Fingerprints::new();
//! hashes.insert("bin/app.exe".to_string(), "00112233445566778899aabbccddeeff".to_string());
//! let request = UpdateRequest::new(hashes).with_transfer_mode(TransferMode::Archive);
//! assert_eq!(request.client_version, 0);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod result;
pub mod types;

// Re-export commonly used types
pub use error::{ApplyFailure, Error, ErrorKind};
pub use result::Result;
pub use types::*;
