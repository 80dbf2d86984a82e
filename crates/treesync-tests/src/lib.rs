//! treesync integration test support
//!
//! The tests under `tests/` drive the fingerprint, diff, pack and apply
//! pipeline directly and through the HTTP server and client.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod test_utils;
