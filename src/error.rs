//! Error types and result definitions

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for archive operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the archive
#[derive(Error, Debug)]
pub enum Error {
    /// IO error while staging, committing or reading files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Row or footer (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Malformed JSON tuple input
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed value bytes
    #[error("Codec error: {0}")]
    Codec(String),

    /// A row file whose framing is damaged
    #[error("Corrupt table {}: {reason}", path.display())]
    CorruptTable { path: PathBuf, reason: String },

    /// A stored id with no mapping file entry
    #[error("No {namespace} mapping for id {id}")]
    MissingMapping { namespace: &'static str, id: u64 },

    /// Input rejected before touching storage
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The archive lock could not be acquired in time
    #[error("Timed out acquiring the {0} permit")]
    LockTimeout(&'static str),

    /// The archive was closed
    #[error("Archive is closed")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
