//! HTTP server and client for treesync
//!
//! The server publishes one or more application trees. Clients post the
//! fingerprints of their local copy to `POST /hasupdate/{app}` and receive
//! the diff plus, for archive clients, the URL of a gzip-compressed tar
//! archive holding every changed file. Per-file clients fetch each changed
//! file from `GET /app/{app}/{path}` instead.
//!
//! # Examples
//!
//! ```rust,no_run
//! use treesync_config::ClientConfig;
//! use treesync_network::{UpdateClient, UpdateOutcome};
//!
//! # async fn example() -> treesync_types::Result<()> {
//! let client = UpdateClient::new(ClientConfig::new("updates.local:8080", "game", "./game"))?;
//! match client.run().await? {
//!     UpdateOutcome::Updated { files } => println!("{} file(s) updated", files),
//!     outcome => println!("{:?}", outcome),
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{has_state_file, UpdateClient, UpdateOutcome, DOWNLOAD_CONCURRENCY};
pub use protocol::{base_url, decode_request, encode_request, patch_file_url};
pub use server::{router, serve, serve_on, spawn_invalidation, PublishedApp, SyncCoordinator};
