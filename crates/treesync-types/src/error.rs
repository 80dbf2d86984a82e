//! Error types and handling for treesync
//!
//! Every failure a sync cycle can hit is one of a handful of categories: the
//! source tree could not be read, the destination could not be written, or the
//! peer sent something that does not match what was promised. Variants carry
//! the offending path (when there is one) so a log line is enough to diagnose
//! the aborted cycle.

use std::fmt;
use std::path::{Path, PathBuf};

/// Main error type for treesync operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A source tree could not be listed or one of its files could not be read
    #[error("read error at '{}': {message}", path.display())]
    Read {
        /// Path that failed
        path: PathBuf,
        /// Underlying error description
        message: String,
    },

    /// A destination file could not be written, even after the rename fallback
    #[error("write error at '{}': {message}", path.display())]
    Write {
        /// Path that failed
        path: PathBuf,
        /// Underlying error description
        message: String,
    },

    /// Malformed request/response or content that does not match its advertised hash
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the mismatch
        message: String,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Network error
    #[error("network error: {message}")]
    Network {
        /// Error message describing the network issue
        message: String,
    },

    /// I/O error with no better classification
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Source tree unreadable
    Read,
    /// Destination unwritable
    Write,
    /// Malformed or mismatching data from a peer
    Protocol,
    /// Configuration errors
    Config,
    /// Network errors
    Network,
    /// Unclassified I/O errors
    Io,
    /// Other errors
    Other,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Read { .. } => ErrorKind::Read,
            Self::Write { .. } => ErrorKind::Write,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Config { .. } => ErrorKind::Config,
            Self::Network { .. } => ErrorKind::Network,
            Self::Io { .. } => ErrorKind::Io,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Path the error refers to, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. } | Self::Write { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Create a read error for `path`
    pub fn read(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::Read {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create a write error for `path`
    pub fn write(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::Write {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Protocol error for content whose hash differs from the advertised one
    pub fn hash_mismatch(path: &str, expected: &str, actual: &str) -> Self {
        Self::protocol(format!(
            "hash mismatch for '{}': expected {}, got {}",
            path, expected, actual
        ))
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

/// Failure of a patch apply, with the number of files already written
///
/// Apply is atomic per file only. Files written before the failing record stay
/// in place, so callers get the count alongside the cause.
#[derive(thiserror::Error, Debug)]
#[error("patch apply stopped after {applied} file(s): {error}")]
pub struct ApplyFailure {
    /// Files fully written before the failure
    pub applied: usize,
    /// The error that stopped the apply
    #[source]
    pub error: Error,
}

impl ApplyFailure {
    /// Wrap `error` raised after `applied` files were written
    pub fn new(applied: usize, error: Error) -> Self {
        Self { applied, error }
    }
}

impl From<ApplyFailure> for Error {
    fn from(failure: ApplyFailure) -> Self {
        failure.error
    }
}
