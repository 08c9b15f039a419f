/*!
Error types for the petstash core engine.
*/

use thiserror::Error;

use crate::restore::RestorePhase;

/// Result type used throughout the petstash core.
pub type Result<T> = std::result::Result<T, PetstashError>;

/// Errors that can occur while exporting, validating or restoring a snapshot.
#[derive(Error, Debug)]
pub enum PetstashError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors raised by the relational store
    #[error("Database error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Invalid base64 payload in a file entry
    #[error("Invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Blob area or backup directory errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// A relative path escaped the upload root or was otherwise unusable
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// A table name outside the reserved prefix reached a destructive routine
    #[error("Table '{0}' is not owned by petstash")]
    TableNotOwned(String),

    /// Captured schema that cannot be replayed safely
    #[error("Invalid table schema for '{table}': {reason}")]
    InvalidSchema { table: String, reason: String },

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// The snapshot builder could not read part of the live dataset
    #[error("Export failed: {0}")]
    Export(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound snapshot rejected before any mutation
    #[error("Invalid snapshot: {0}")]
    Validation(#[from] ValidationError),

    /// Any failure between wiping and restoring blobs; the database was rolled back
    #[error("Restore failed while {phase}: {source}")]
    Restore {
        phase: RestorePhase,
        #[source]
        source: Box<PetstashError>,
    },
}

impl PetstashError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new export error
    pub fn export<S: Into<String>>(msg: S) -> Self {
        Self::Export(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_path<P: Into<String>, R: Into<String>>(path: P, reason: R) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_schema<T: Into<String>, R: Into<String>>(table: T, reason: R) -> Self {
        Self::InvalidSchema {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// True when the error was raised by the validator, i.e. nothing was mutated.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Reasons an inbound snapshot document is rejected.
///
/// Rules are checked in declaration order and the first failure wins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("the document is not valid JSON: {0}")]
    NotJson(String),

    #[error("the document root must be a JSON object")]
    NotAnObject,

    #[error("this backup was not produced by petstash (plugin tag: {found:?})")]
    ForeignPlugin { found: Option<String> },

    #[error("the backup does not declare a schema version")]
    MissingSchemaVersion,

    #[error("unsupported schema version {found} (this installation understands {supported})")]
    UnsupportedSchemaVersion { found: String, supported: u32 },

    #[error("required block '{block}' is missing")]
    MissingBlock { block: &'static str },

    #[error("block '{block}' must be a list")]
    BlockNotList { block: &'static str },

    #[error("{block}[{index}] must be an object")]
    EntryNotObject { block: &'static str, index: usize },

    #[error("{block}[{index}] has no valid 'post' object")]
    InvalidPost { block: &'static str, index: usize },

    #[error("{block}[{index}] has a 'meta' value that is not an object")]
    InvalidMeta { block: &'static str, index: usize },

    #[error("malformed backup content: {0}")]
    Malformed(String),
}
